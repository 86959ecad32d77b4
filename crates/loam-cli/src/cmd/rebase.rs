use anyhow::Result;
use clap::Args;
use loam_core::clock::Timestamp;
use loam_core::config::EngineConfig;
use loam_core::error::ErrorCode;
use loam_core::rebase::Rebaser;
use loam_core::store::{META_GLOBAL_ACK, Storage};
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use tracing::info;

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct RebaseArgs {
    /// Fold operations at or below this timestamp instead of the stored
    /// global acknowledgement.
    #[arg(long)]
    pub through: Option<String>,

    /// Ignore `rebase.min_operations` and compact whatever is eligible.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct RebaseOutput {
    cutoff: String,
    enabled: bool,
    eligible: usize,
    skipped: bool,
    oids_rebased: usize,
    operations_compacted: usize,
    baselines_written: usize,
    baselines_removed: usize,
    failed: Vec<String>,
}

/// Execute `loam rebase`.
pub fn run_rebase(
    args: &RebaseArgs,
    db: Option<&Path>,
    engine: &EngineConfig,
    output: OutputMode,
) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;

    let stored_ack = store.meta(META_GLOBAL_ACK)?;
    let Some(raw) = args.through.clone().or(stored_ack) else {
        return super::fail(
            output,
            &CliError::with_code(
                "no cutoff: the store has no global acknowledgement yet; pass --through",
                ErrorCode::RebaseFailed,
            ),
        );
    };
    let cutoff = match Timestamp::parse(&raw) {
        Ok(cutoff) => cutoff,
        Err(err) => {
            return super::fail(
                output,
                &CliError::with_code(format!("invalid cutoff {raw:?}: {err}"), err.code()),
            );
        }
    };

    let eligible = store.operations_through(&cutoff)?.len();
    let skipped = !args.force && eligible < engine.rebase.min_operations;
    let mut out = RebaseOutput {
        cutoff: cutoff.to_string(),
        enabled: engine.rebase.enabled,
        eligible,
        skipped,
        oids_rebased: 0,
        operations_compacted: 0,
        baselines_written: 0,
        baselines_removed: 0,
        failed: Vec::new(),
    };

    if skipped {
        info!(eligible, min = engine.rebase.min_operations, "rebase skipped");
    } else {
        let report = match Rebaser::new(engine.rebase.enabled).run(&store, &cutoff) {
            Ok(report) => report,
            Err(err) => {
                return super::fail(output, &CliError::with_code(err.to_string(), err.code()));
            }
        };
        out.oids_rebased = report.oids_rebased;
        out.operations_compacted = report.operations_compacted;
        out.baselines_written = report.baselines_written;
        out.baselines_removed = report.baselines_removed;
        out.failed = report.failed.iter().map(ToString::to_string).collect();
    }

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "rebase cutoff={} enabled={} eligible={} skipped={} oids={} compacted={} failed={}",
                out.cutoff,
                out.enabled,
                out.eligible,
                out.skipped,
                out.oids_rebased,
                out.operations_compacted,
                out.failed.len()
            )
        },
        |out, w| {
            pretty_section(w, "Rebase")?;
            pretty_kv(w, "Cutoff", &out.cutoff)?;
            if !out.enabled {
                pretty_kv(w, "Status", "disabled in config; history kept")?;
                return Ok(());
            }
            if out.skipped {
                pretty_kv(w, "Status", format!("skipped, only {} eligible", out.eligible))?;
                return Ok(());
            }
            pretty_kv(w, "OIDs", out.oids_rebased.to_string())?;
            pretty_kv(w, "Compacted", out.operations_compacted.to_string())?;
            pretty_kv(w, "Written", out.baselines_written.to_string())?;
            pretty_kv(w, "Removed", out.baselines_removed.to_string())?;
            for oid in &out.failed {
                pretty_kv(w, "Failed", oid)?;
            }
            Ok(())
        },
    )?;

    Ok(if out.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
