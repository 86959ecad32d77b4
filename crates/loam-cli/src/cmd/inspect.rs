//! Read-only views over a replica store.

use anyhow::Result;
use clap::Args;
use loam_core::oid::{Oid, OidRange, collection_range, oid_range};
use loam_core::store::{Storage, documents};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::process::ExitCode;

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct OpsArgs {
    /// Only operations on this OID and its nested objects.
    pub oid: Option<String>,

    /// Only operations in this collection.
    #[arg(long, conflicts_with = "oid")]
    pub collection: Option<String>,

    /// Show at most this many, newest last.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct BaselinesArgs {
    /// Only baselines of this OID and its nested objects.
    pub oid: Option<String>,
}

#[derive(Args, Debug)]
pub struct DocsArgs {
    pub collection: String,
}

#[derive(Debug, Serialize)]
struct OpRow {
    oid: String,
    timestamp: String,
    patch: &'static str,
    data: Value,
}

#[derive(Debug, Serialize)]
struct BaselineRow {
    oid: String,
    timestamp: String,
    snapshot: Value,
}

#[derive(Debug, Serialize)]
struct ReplicaRow {
    id: String,
    library_id: String,
    replica_type: Value,
    status: Value,
    acked_logical_time: Option<String>,
    acked_server_order: u64,
    last_seen_ms: u64,
}

/// Resolve a positional OID into a range scan, or report a coded error.
fn range_for(raw: Option<&str>) -> std::result::Result<Option<OidRange>, CliError> {
    raw.map(|raw| {
        Oid::parse(raw)
            .map(|oid| oid_range(&oid))
            .map_err(|err| CliError::with_code(format!("invalid oid {raw:?}: {err}"), err.code()))
    })
    .transpose()
}

/// Execute `loam ops`.
pub fn run_ops(args: &OpsArgs, db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;
    let range = match (range_for(args.oid.as_deref()), &args.collection) {
        (Err(err), _) => return super::fail(output, &err),
        (Ok(Some(range)), _) => Some(range),
        (Ok(None), Some(collection)) => Some(collection_range(collection)),
        (Ok(None), None) => None,
    };
    let mut operations = match &range {
        Some(range) => store.operations_in(range)?,
        None => store.operations_after(None)?,
    };
    operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    if let Some(limit) = args.limit {
        let skip = operations.len().saturating_sub(limit);
        operations.drain(..skip);
    }

    let rows = operations
        .into_iter()
        .map(|op| {
            Ok(OpRow {
                oid: op.oid.to_string(),
                timestamp: op.timestamp.to_string(),
                patch: op.data.kind(),
                data: serde_json::to_value(&op.data)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    render_mode(
        output,
        &rows,
        |rows, w| {
            for row in rows {
                writeln!(w, "{}  {}  {}  {}", row.timestamp, row.oid, row.patch, row.data)?;
            }
            Ok(())
        },
        |rows, w| {
            pretty_section(w, &format!("Operations ({})", rows.len()))?;
            for row in rows {
                writeln!(w, "{}  {:<10} {}", row.timestamp, row.patch, row.oid)?;
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// Execute `loam baselines`.
pub fn run_baselines(args: &BaselinesArgs, db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;
    let baselines = match range_for(args.oid.as_deref()) {
        Err(err) => return super::fail(output, &err),
        Ok(Some(range)) => store.baselines_in(&range)?,
        Ok(None) => store.all_baselines()?,
    };
    let rows: Vec<BaselineRow> = baselines
        .into_iter()
        .map(|baseline| BaselineRow {
            oid: baseline.oid.to_string(),
            timestamp: baseline.timestamp.to_string(),
            snapshot: baseline.snapshot,
        })
        .collect();

    render_mode(
        output,
        &rows,
        |rows, w| {
            for row in rows {
                writeln!(w, "{}  {}  {}", row.oid, row.timestamp, row.snapshot)?;
            }
            Ok(())
        },
        |rows, w| {
            pretty_section(w, &format!("Baselines ({})", rows.len()))?;
            for row in rows {
                pretty_kv(w, &row.oid, format!("{} {}", row.timestamp, row.snapshot))?;
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// Execute `loam docs <collection>`.
pub fn run_docs(args: &DocsArgs, db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;
    let docs: Vec<(String, Value)> = documents(&store, &args.collection)?
        .into_iter()
        .map(|(oid, doc)| (oid.to_string(), doc))
        .collect();

    render_mode(
        output,
        &docs,
        |docs, w| {
            for (oid, doc) in docs {
                writeln!(w, "{oid}  {doc}")?;
            }
            Ok(())
        },
        |docs, w| {
            pretty_section(w, &format!("{} ({})", args.collection, docs.len()))?;
            for (oid, doc) in docs {
                writeln!(w, "{oid}")?;
                let body = serde_json::to_string_pretty(doc).map_err(std::io::Error::other)?;
                for line in body.lines() {
                    writeln!(w, "  {line}")?;
                }
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// Execute `loam replicas`.
pub fn run_replicas(db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;
    let rows = store
        .replicas()?
        .into_iter()
        .map(|info| {
            Ok(ReplicaRow {
                id: info.id.to_string(),
                library_id: info.library_id,
                replica_type: serde_json::to_value(info.replica_type)?,
                status: serde_json::to_value(info.status)?,
                acked_logical_time: info.acked_logical_time.map(|ts| ts.to_string()),
                acked_server_order: info.acked_server_order,
                last_seen_ms: info.last_seen_wall_clock_time,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    render_mode(
        output,
        &rows,
        |rows, w| {
            for row in rows {
                writeln!(
                    w,
                    "replica id={} type={} status={} acked={} server_order={}",
                    row.id,
                    plain(&row.replica_type),
                    plain(&row.status),
                    row.acked_logical_time.as_deref().unwrap_or("-"),
                    row.acked_server_order
                )?;
            }
            Ok(())
        },
        |rows, w| {
            pretty_section(w, &format!("Replicas ({})", rows.len()))?;
            for row in rows {
                pretty_kv(
                    w,
                    &row.id,
                    format!(
                        "{} {} acked={}",
                        plain(&row.replica_type),
                        plain(&row.status),
                        row.acked_logical_time.as_deref().unwrap_or("never")
                    ),
                )?;
            }
            Ok(())
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// A JSON string without its quotes.
fn plain(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), String::from)
}
