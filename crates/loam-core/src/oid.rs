//! Object identifiers (OIDs) and their range-scan properties.
//!
//! # Grammar
//!
//! ```text
//! oid       = collection "/" id *( "#" segment )
//! component = 1*( unreserved / "%" HEXDIG HEXDIG )
//! unreserved = ALPHA / DIGIT / "-" / "." / "_" / "~"
//! ```
//!
//! Every component is percent-escaped, so after escaping it only contains
//! bytes `>= 0x25` (`%`). The separators `#` (0x23) and the range sentinel
//! `$` (0x24) sort below all of them. That gives the key property used by
//! every store: the half-open string range `[oid, oid + "$")` contains the
//! OID itself and every descendant, and no sibling whose id merely shares a
//! prefix (`todos/a` never captures `todos/ab` or `todos/a-b`).
//!
//! A parent OID is always a string prefix of its children. Nested objects are
//! addressed by synthetic sub-ids, never by list position, so an OID stays
//! valid across sibling insertions and deletions and is never reused.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Separator between collection and primary key.
pub const ROOT_SEPARATOR: char = '/';
/// Separator between nested path segments.
pub const PATH_SEPARATOR: char = '#';
/// Sentinel appended to an OID to form the exclusive end of its range.
const RANGE_END: char = '$';

const SUB_ID_LEN: usize = 10;

/// Errors raised while building or parsing OIDs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OidError {
    #[error("empty {0} in object identifier")]
    EmptyComponent(&'static str),

    #[error("malformed object identifier {raw:?}: {reason}")]
    Malformed { raw: String, reason: &'static str },
}

impl OidError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidOid
    }
}

/// A validated object identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

/// The components of an OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedOid {
    pub collection: String,
    pub id: String,
    pub path: Vec<String>,
}

/// Half-open string range `[start, end)` over encoded OIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidRange {
    pub start: String,
    pub end: String,
}

impl OidRange {
    #[must_use]
    pub fn contains(&self, oid: &Oid) -> bool {
        oid.as_str() >= self.start.as_str() && oid.as_str() < self.end.as_str()
    }
}

/// Build an OID from a collection, primary key and nested path.
///
/// # Errors
///
/// Returns [`OidError::EmptyComponent`] if any component is empty.
pub fn create_oid(collection: &str, primary_key: &str, path: &[&str]) -> Result<Oid, OidError> {
    if collection.is_empty() {
        return Err(OidError::EmptyComponent("collection"));
    }
    if primary_key.is_empty() {
        return Err(OidError::EmptyComponent("primary key"));
    }

    let mut raw = escape(collection);
    raw.push(ROOT_SEPARATOR);
    raw.push_str(&escape(primary_key));
    for segment in path {
        if segment.is_empty() {
            return Err(OidError::EmptyComponent("path segment"));
        }
        raw.push(PATH_SEPARATOR);
        raw.push_str(&escape(segment));
    }
    Ok(Oid(raw))
}

/// Split an OID back into its unescaped components.
#[must_use]
pub fn decompose_oid(oid: &Oid) -> DecomposedOid {
    // Oid values are validated on construction, so decoding cannot fail.
    decompose_raw(oid.as_str()).unwrap_or_else(|_| DecomposedOid {
        collection: String::new(),
        id: String::new(),
        path: Vec::new(),
    })
}

/// The half-open range covering `oid` and all of its descendants.
#[must_use]
pub fn oid_range(oid: &Oid) -> OidRange {
    let mut end = oid.0.clone();
    end.push(RANGE_END);
    OidRange {
        start: oid.0.clone(),
        end,
    }
}

/// The half-open range covering every OID in `collection`.
#[must_use]
pub fn collection_range(collection: &str) -> OidRange {
    let prefix = escape(collection);
    let mut start = prefix.clone();
    start.push(ROOT_SEPARATOR);
    let mut end = prefix;
    // '0' is the byte after '/', and '/' never appears in an escaped component.
    end.push('0');
    OidRange { start, end }
}

/// A random sub-id for a nested object created by a local edit.
#[must_use]
pub fn random_sub_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUB_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// A sub-id derived from the parent OID and a stable key.
///
/// Used for migration-authored nested objects so every replica running the
/// same migration derives the same OIDs.
#[must_use]
pub fn derived_sub_id(parent: &Oid, key: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(key.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..SUB_ID_LEN].to_string()
}

impl Oid {
    /// Parse and validate an encoded OID.
    ///
    /// # Errors
    ///
    /// Returns [`OidError::Malformed`] if the text does not follow the OID
    /// grammar (including non-canonical escapes).
    pub fn parse(raw: &str) -> Result<Self, OidError> {
        let decomposed = decompose_raw(raw)?;
        let path: Vec<&str> = decomposed.path.iter().map(String::as_str).collect();
        let canonical = create_oid(&decomposed.collection, &decomposed.id, &path)?;
        if canonical.0 != raw {
            return Err(OidError::Malformed {
                raw: raw.to_string(),
                reason: "non-canonical escaping",
            });
        }
        Ok(canonical)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The root document OID (`collection/id`) of this OID.
    #[must_use]
    pub fn root(&self) -> Self {
        match self.0.find(PATH_SEPARATOR) {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => self.clone(),
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        !self.0.contains(PATH_SEPARATOR)
    }

    /// The immediate parent, or `None` for a root OID.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind(PATH_SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// A child OID one path segment below this one.
    ///
    /// # Errors
    ///
    /// Returns [`OidError::EmptyComponent`] for an empty segment.
    pub fn child(&self, segment: &str) -> Result<Self, OidError> {
        if segment.is_empty() {
            return Err(OidError::EmptyComponent("path segment"));
        }
        let mut raw = self.0.clone();
        raw.push(PATH_SEPARATOR);
        raw.push_str(&escape(segment));
        Ok(Self(raw))
    }

    /// True if `self` is `ancestor` or lies below it.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        oid_range(ancestor).contains(self)
    }

    #[must_use]
    pub fn collection(&self) -> String {
        decompose_oid(self).collection
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Oid {
    type Err = OidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Oid {
    type Error = OidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Oid> for String {
    fn from(value: Oid) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

const fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn escape(raw: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if is_unreserved(b) {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(b >> 4)]));
            out.push(char::from(HEX[usize::from(b & 0x0f)]));
        }
    }
    out
}

fn unescape(raw: &str, full: &str) -> Result<String, OidError> {
    let malformed = |reason| OidError::Malformed {
        raw: full.to_string(),
        reason,
    };

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let b = bytes[idx];
        if b == b'%' {
            let hi = bytes.get(idx + 1).and_then(|c| hex_nibble(*c));
            let lo = bytes.get(idx + 2).and_then(|c| hex_nibble(*c));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(malformed("bad percent escape")),
            }
            idx += 3;
        } else if is_unreserved(b) {
            out.push(b);
            idx += 1;
        } else {
            return Err(malformed("unescaped reserved character"));
        }
    }
    String::from_utf8(out).map_err(|_| malformed("escape is not valid UTF-8"))
}

const fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn decompose_raw(raw: &str) -> Result<DecomposedOid, OidError> {
    let (collection, rest) = raw.split_once(ROOT_SEPARATOR).ok_or(OidError::Malformed {
        raw: raw.to_string(),
        reason: "missing collection separator",
    })?;

    let mut parts = rest.split(PATH_SEPARATOR);
    let id = parts.next().unwrap_or_default();
    if collection.is_empty() {
        return Err(OidError::EmptyComponent("collection"));
    }
    if id.is_empty() {
        return Err(OidError::EmptyComponent("primary key"));
    }

    let mut path = Vec::new();
    for segment in parts {
        if segment.is_empty() {
            return Err(OidError::EmptyComponent("path segment"));
        }
        path.push(unescape(segment, raw)?);
    }

    Ok(DecomposedOid {
        collection: unescape(collection, raw)?,
        id: unescape(id, raw)?,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(collection: &str, id: &str, path: &[&str]) -> Oid {
        create_oid(collection, id, path).expect("valid oid")
    }

    #[test]
    fn create_and_decompose_roundtrip() {
        let o = oid("todos", "a/b#c", &["tags", "x y"]);
        assert_eq!(o.as_str(), "todos/a%2Fb%23c#tags#x%20y");
        let d = decompose_oid(&o);
        assert_eq!(d.collection, "todos");
        assert_eq!(d.id, "a/b#c");
        assert_eq!(d.path, vec!["tags".to_string(), "x y".to_string()]);
    }

    #[test]
    fn parent_is_string_prefix_of_child() {
        let root = oid("todos", "1", &[]);
        let child = root.child("sub1").expect("child");
        let grandchild = child.child("sub2").expect("child");
        assert!(child.as_str().starts_with(root.as_str()));
        assert!(grandchild.as_str().starts_with(child.as_str()));
        assert_eq!(grandchild.parent(), Some(child.clone()));
        assert_eq!(grandchild.root(), root);
        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn range_excludes_prefix_siblings() {
        let parent = oid("todos", "a", &[]);
        let range = oid_range(&parent);

        let inside = [
            parent.clone(),
            parent.child("x").expect("child"),
            parent.child("x").and_then(|c| c.child("y")).expect("child"),
        ];
        let outside = [
            oid("todos", "ab", &[]),
            oid("todos", "a-b", &[]),
            oid("todos", "a.b", &[]),
            oid("todos", "a b", &[]),
            oid("todos", "a$", &[]),
            oid("todos", "A", &[]),
            oid("todo", "a", &[]),
        ];

        for o in &inside {
            assert!(range.contains(o), "{o} should be in range");
        }
        for o in &outside {
            assert!(!range.contains(o), "{o} should not be in range");
        }
    }

    #[test]
    fn collection_range_excludes_similar_collections() {
        let range = collection_range("todos");
        assert!(range.contains(&oid("todos", "x", &["y"])));
        assert!(!range.contains(&oid("todos-archive", "x", &[])));
        assert!(!range.contains(&oid("todos0", "x", &[])));
        assert!(!range.contains(&oid("todo", "x", &[])));
    }

    #[test]
    fn escaped_keys_cannot_forge_children() {
        // A primary key containing the path separator must not look like a child.
        let forged = oid("todos", "a#x", &[]);
        let parent = oid("todos", "a", &[]);
        assert!(!forged.is_descendant_of(&parent));
        assert!(forged.is_root());
    }

    #[test]
    fn parse_rejects_malformed() {
        for raw in ["", "todos", "/a", "todos/", "todos/a#", "todos/a b", "todos/%zz", "todos/%2f"] {
            assert!(Oid::parse(raw).is_err(), "accepted {raw:?}");
        }
        assert!(Oid::parse("todos/a%2Fb#c").is_ok());
    }

    #[test]
    fn empty_components_rejected() {
        assert_eq!(create_oid("", "a", &[]), Err(OidError::EmptyComponent("collection")));
        assert_eq!(create_oid("t", "", &[]), Err(OidError::EmptyComponent("primary key")));
        assert_eq!(
            create_oid("t", "a", &[""]),
            Err(OidError::EmptyComponent("path segment"))
        );
    }

    #[test]
    fn derived_sub_ids_are_stable() {
        let parent = oid("todos", "1", &[]);
        assert_eq!(derived_sub_id(&parent, "tags"), derived_sub_id(&parent, "tags"));
        assert_ne!(derived_sub_id(&parent, "tags"), derived_sub_id(&parent, "notes"));
        assert_eq!(random_sub_id().len(), 10);
    }
}
