use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;
use loam_core::clock::ReplicaId;
use loam_core::config::EngineConfig;
use loam_core::store::{META_REPLICA_ID, Storage, WriteBatch};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use tracing::info;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Fixed replica id. Falls back to `replica.id` in the config, then a
    /// generated one.
    #[arg(long)]
    pub replica_id: Option<String>,

    /// Also write a default `.loam/config.toml` under the current directory.
    #[arg(long)]
    pub write_config: bool,
}

#[derive(Debug, Serialize)]
struct InitOutput {
    path: String,
    replica_id: String,
    /// False when the store already had a replica id.
    created: bool,
    config_written: Option<String>,
    initialized_at: String,
}

/// Execute `loam init`: create the store and assign its replica id.
///
/// An existing store keeps its replica id; asking for a different one is an
/// error.
pub fn run_init(
    args: &InitArgs,
    db: Option<&Path>,
    project_root: &Path,
    engine: &EngineConfig,
    output: OutputMode,
) -> Result<ExitCode> {
    let path = super::store_path(db)?;
    let store = loam_core::store::SqliteStore::open(&path)
        .with_context(|| format!("create store {}", path.display()))?;

    let existing = store.meta(META_REPLICA_ID)?;
    let wanted = args.replica_id.as_ref().or(engine.replica.id.as_ref());
    let (replica_id, created) = match (existing, wanted) {
        (Some(current), Some(wanted)) if current != *wanted => {
            anyhow::bail!("store already belongs to replica {current:?}, not {wanted:?}");
        }
        (Some(current), _) => (current, false),
        (None, wanted) => {
            let id = match wanted {
                Some(raw) => ReplicaId::new(raw).with_context(|| format!("invalid replica id {raw:?}"))?,
                None => ReplicaId::generate(),
            };
            let mut batch = WriteBatch::new();
            batch.set_meta(META_REPLICA_ID, id.as_str());
            store.commit(batch)?;
            (id.as_str().to_string(), true)
        }
    };

    let config_written = if args.write_config {
        Some(write_default_config(project_root)?)
    } else {
        None
    };

    info!(path = %path.display(), replica = %replica_id, created, "store initialized");
    let out = InitOutput {
        path: path.display().to_string(),
        replica_id,
        created,
        config_written,
        initialized_at: Utc::now().to_rfc3339(),
    };
    render_mode(
        output,
        &out,
        |out, w| writeln!(w, "init path={} replica={} created={}", out.path, out.replica_id, out.created),
        |out, w| {
            pretty_section(w, "Store")?;
            pretty_kv(w, "Path", &out.path)?;
            pretty_kv(w, "Replica", &out.replica_id)?;
            pretty_kv(w, "Created", if out.created { "yes" } else { "already existed" })?;
            if let Some(config) = &out.config_written {
                pretty_kv(w, "Config", config)?;
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// Write `.loam/config.toml` with every default spelled out, unless one
/// exists.
fn write_default_config(project_root: &Path) -> Result<String> {
    let dir = project_root.join(".loam");
    let path = dir.join("config.toml");
    if !path.exists() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let body = toml::to_string_pretty(&EngineConfig::default()).context("render default config")?;
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(path.display().to_string())
}
