use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::Path;

use crate::clock::ReplicaId;
use crate::clock::skew::DEFAULT_SKEW_THRESHOLD_SECS;
use crate::replica::{DEFAULT_TRUANCY_TIMEOUT_MS, ReplicaType};
use crate::undo::DEFAULT_UNDO_LIMIT;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub replica: ReplicaConfig,
    #[serde(default)]
    pub rebase: RebaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub undo: UndoConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Fixed replica id. Generated and persisted in the store when unset.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_library_id")]
    pub library_id: String,
    #[serde(default)]
    pub replica_type: ReplicaType,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            id: None,
            library_id: default_library_id(),
            replica_type: ReplicaType::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseConfig {
    /// Disabled mode keeps every operation forever.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip a cycle when fewer operations than this are eligible.
    #[serde(default)]
    pub min_operations: usize,
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            min_operations: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_truancy_timeout_ms")]
    pub truancy_timeout_ms: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            truancy_timeout_ms: default_truancy_timeout_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "default_skew_threshold_secs")]
    pub skew_threshold_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            skew_threshold_secs: default_skew_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoConfig {
    #[serde(default = "default_undo_limit")]
    pub limit: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            limit: default_undo_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub engine: EngineConfig,
    pub resolved_output: String,
}

pub fn load_engine_config(root: &Path) -> Result<EngineConfig> {
    let path = root.join(".loam/config.toml");
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn resolve_engine_config(root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let engine = apply_env_overrides(
        load_engine_config(root)?,
        env::var("LOAM_REBASE").ok(),
        env::var("LOAM_REPLICA_ID").ok(),
    )?;
    let resolved_output = resolve_output(cli_json, env::var("LOAM_FORMAT").ok());

    Ok(EffectiveConfig {
        engine,
        resolved_output,
    })
}

fn apply_env_overrides(
    mut config: EngineConfig,
    rebase: Option<String>,
    replica_id: Option<String>,
) -> Result<EngineConfig> {
    if let Some(raw) = rebase {
        config.rebase.enabled = match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => true,
            "off" | "false" | "0" => false,
            other => bail!("LOAM_REBASE must be on or off, got {other:?}"),
        };
    }
    if let Some(id) = replica_id {
        if !ReplicaId::is_valid(&id) {
            bail!("LOAM_REPLICA_ID {id:?} is not a valid replica id");
        }
        config.replica.id = Some(id);
    }
    Ok(config)
}

fn resolve_output(cli_json: bool, env_format: Option<String>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some("pretty"),
            "text" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_true() -> bool {
    true
}

fn default_library_id() -> String {
    "default".to_string()
}

const fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

const fn default_truancy_timeout_ms() -> u64 {
    DEFAULT_TRUANCY_TIMEOUT_MS
}

const fn default_retry_initial_ms() -> u64 {
    250
}

const fn default_retry_max_ms() -> u64 {
    30_000
}

const fn default_retry_max_attempts() -> u32 {
    8
}

const fn default_skew_threshold_secs() -> u64 {
    DEFAULT_SKEW_THRESHOLD_SECS
}

const fn default_undo_limit() -> usize {
    DEFAULT_UNDO_LIMIT
}
