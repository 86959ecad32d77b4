pub mod init;
pub mod inspect;
pub mod rebase;
pub mod sim;
pub mod status;
pub mod verify;

use anyhow::{Context, Result};
use loam_core::store::SqliteStore;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::output::{CliError, OutputMode, render_error};

/// File name of the store inside the default data directory.
const DEFAULT_DB_NAME: &str = "replica.db";

/// Where the store lives: `--db`, then `LOAM_DB`, then
/// `<data dir>/loam/replica.db`.
pub fn store_path(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env::var_os("LOAM_DB") {
        return Ok(PathBuf::from(path));
    }
    let data = dirs::data_dir().context("no data directory on this platform; pass --db")?;
    Ok(data.join("loam").join(DEFAULT_DB_NAME))
}

/// Open an existing store. Read commands never create one.
pub fn open_existing(flag: Option<&Path>) -> Result<(PathBuf, SqliteStore)> {
    let path = store_path(flag)?;
    if !path.exists() {
        anyhow::bail!("no store at {}; run `loam init` first", path.display());
    }
    let store = SqliteStore::open(&path).with_context(|| format!("open store {}", path.display()))?;
    Ok((path, store))
}

/// Report a coded failure and exit non-zero.
pub fn fail(mode: OutputMode, error: &CliError) -> Result<ExitCode> {
    render_error(mode, error)?;
    Ok(ExitCode::FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let path = store_path(Some(Path::new("/tmp/x.db"))).expect("path");
        assert_eq!(path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn missing_store_is_not_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.db");
        assert!(open_existing(Some(&path)).is_err());
        assert!(!path.exists());
    }
}
