use anyhow::Result;
use loam_core::store::{
    META_CONFIRMED_THROUGH, META_GLOBAL_ACK, META_REPLICA_ID, META_SCHEMA_VERSION, META_SERVER_ORDER, Storage,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Debug, Serialize)]
struct StatusOutput {
    path: String,
    replica_id: Option<String>,
    schema_version: Option<String>,
    global_ack: Option<String>,
    confirmed_through: Option<String>,
    server_order: Option<String>,
    operations: usize,
    baselines: usize,
    replicas: usize,
    /// Operation count per collection.
    collections: BTreeMap<String, usize>,
}

/// Execute `loam status`.
pub fn run_status(db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (path, store) = super::open_existing(db)?;
    let operations = store.operations_after(None)?;
    let mut collections: BTreeMap<String, usize> = BTreeMap::new();
    for op in &operations {
        *collections.entry(op.oid.collection()).or_default() += 1;
    }

    let out = StatusOutput {
        path: path.display().to_string(),
        replica_id: store.meta(META_REPLICA_ID)?,
        schema_version: store.meta(META_SCHEMA_VERSION)?,
        global_ack: store.meta(META_GLOBAL_ACK)?,
        confirmed_through: store.meta(META_CONFIRMED_THROUGH)?,
        server_order: store.meta(META_SERVER_ORDER)?,
        operations: operations.len(),
        baselines: store.all_baselines()?.len(),
        replicas: store.replicas()?.len(),
        collections,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "status replica={} schema={} operations={} baselines={} replicas={} global_ack={}",
                out.replica_id.as_deref().unwrap_or("-"),
                out.schema_version.as_deref().unwrap_or("-"),
                out.operations,
                out.baselines,
                out.replicas,
                out.global_ack.as_deref().unwrap_or("-"),
            )?;
            for (collection, count) in &out.collections {
                writeln!(w, "collection name={collection} operations={count}")?;
            }
            Ok(())
        },
        |out, w| {
            let none = "(none)";
            pretty_section(w, "Replica Store")?;
            pretty_kv(w, "Path", &out.path)?;
            pretty_kv(w, "Replica", out.replica_id.as_deref().unwrap_or(none))?;
            pretty_kv(w, "Schema", out.schema_version.as_deref().unwrap_or(none))?;
            pretty_kv(w, "Global ack", out.global_ack.as_deref().unwrap_or(none))?;
            pretty_kv(w, "Confirmed", out.confirmed_through.as_deref().unwrap_or(none))?;
            pretty_kv(w, "Server order", out.server_order.as_deref().unwrap_or(none))?;
            pretty_kv(w, "Operations", out.operations.to_string())?;
            pretty_kv(w, "Baselines", out.baselines.to_string())?;
            pretty_kv(w, "Replicas", out.replicas.to_string())?;
            if !out.collections.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Collections")?;
                for (collection, count) in &out.collections {
                    pretty_kv(w, collection, count.to_string())?;
                }
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}
