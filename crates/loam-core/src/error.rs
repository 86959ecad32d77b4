use std::fmt;

/// Machine-readable error codes shared by every loam error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidTimestamp,
    InvalidOid,
    InvalidPatch,
    SchemaViolation,
    NoMigrationPath,
    MigrationFailed,
    RebaseFailed,
    AuthorizationDecode,
    StorageFailure,
    StaleOperation,
    SyncRejected,
    SyncTransport,
    NothingToUndo,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidTimestamp => "E2001",
            Self::InvalidOid => "E2002",
            Self::InvalidPatch => "E2003",
            Self::SchemaViolation => "E2004",
            Self::AuthorizationDecode => "E2005",
            Self::NoMigrationPath => "E3001",
            Self::MigrationFailed => "E3002",
            Self::RebaseFailed => "E4001",
            Self::StaleOperation => "E4002",
            Self::StorageFailure => "E5001",
            Self::SyncRejected => "E6001",
            Self::SyncTransport => "E6002",
            Self::NothingToUndo => "E7001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidTimestamp => "Timestamp cannot be parsed or compared",
            Self::InvalidOid => "Malformed object identifier",
            Self::InvalidPatch => "Patch does not fit the target object",
            Self::SchemaViolation => "Document does not match the schema",
            Self::AuthorizationDecode => "Malformed authorization tag",
            Self::NoMigrationPath => "No migration path between schema versions",
            Self::MigrationFailed => "Migration procedure failed",
            Self::RebaseFailed => "Baseline compaction failed",
            Self::StaleOperation => "Operation predates the current baseline",
            Self::StorageFailure => "Storage backend failure",
            Self::SyncRejected => "Sync peer rejected the session",
            Self::SyncTransport => "Sync transport failure",
            Self::NothingToUndo => "Nothing to undo or redo",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .loam/config.toml and retry."),
            Self::InvalidTimestamp => {
                Some("The operation was rejected; check the sending replica's clock encoding.")
            }
            Self::InvalidOid => Some("OIDs look like `collection/id#sub`; escape reserved characters."),
            Self::InvalidPatch | Self::StaleOperation | Self::NothingToUndo => None,
            Self::SchemaViolation => Some("Check field types and nullability against the schema."),
            Self::AuthorizationDecode => {
                Some("Authorization tags must look like `<scheme>:<payload>`.")
            }
            Self::NoMigrationPath => Some(
                "Add the missing migration to the catalog; the client refuses to open without one.",
            ),
            Self::MigrationFailed => Some("Fix the migration procedure and reopen the client."),
            Self::RebaseFailed => Some("No action needed; compaction retries on the next ack advance."),
            Self::StorageFailure => Some("Check disk space and write permissions."),
            Self::SyncRejected => Some("Upgrade or migrate the replica to the server's schema version."),
            Self::SyncTransport => Some("Sync retries with backoff; check connectivity."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }

    /// Whether the failure stops the affected operation outright.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(
            self,
            Self::RebaseFailed | Self::SyncTransport | Self::StaleOperation | Self::NothingToUndo
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
