//! `loam verify`: offline integrity checks over stored history.

use anyhow::Result;
use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::error::ErrorCode;
use loam_core::operation::{Baseline, Operation};
use loam_core::store::{META_CONFIRMED_THROUGH, META_GLOBAL_ACK, META_REPLICA_ID, Storage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use tracing::warn;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Problem {
    code: &'static str,
    subject: String,
    detail: String,
}

impl Problem {
    fn new(code: ErrorCode, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    operations: usize,
    baselines: usize,
    ok: bool,
    problems: Vec<Problem>,
}

/// Every check over one snapshot of the store.
fn check_history(
    operations: &[Operation],
    baselines: &[Baseline],
    meta: &[(&str, Option<String>)],
) -> Vec<Problem> {
    let mut problems = Vec::new();

    let baseline_at: BTreeMap<_, _> = baselines.iter().map(|b| (&b.oid, &b.timestamp)).collect();
    for op in operations {
        if let Err(err) = op.data.validate(&op.oid) {
            problems.push(Problem::new(err.code(), op.oid.as_str(), err.to_string()));
        }
        if let Some(&covered) = baseline_at.get(&op.oid)
            && op.timestamp <= *covered
        {
            problems.push(Problem::new(
                ErrorCode::StaleOperation,
                op.oid.as_str(),
                format!("operation {} is already folded into baseline {covered}", op.timestamp),
            ));
        }
    }

    for baseline in baselines {
        if !baseline.snapshot.is_object() && !baseline.snapshot.is_array() {
            problems.push(Problem::new(
                ErrorCode::InvalidPatch,
                baseline.oid.as_str(),
                "baseline snapshot is not an object or list",
            ));
        }
    }

    for (key, value) in meta {
        let Some(value) = value else { continue };
        let result = if *key == META_REPLICA_ID {
            ReplicaId::new(value).map(drop).map_err(|err| (err.code(), err.to_string()))
        } else {
            Timestamp::parse(value).map(drop).map_err(|err| (err.code(), err.to_string()))
        };
        if let Err((code, detail)) = result {
            problems.push(Problem::new(code, format!("meta:{key}"), detail));
        }
    }

    problems
}

/// Execute `loam verify`. Exits non-zero when any problem is found.
pub fn run_verify(db: Option<&Path>, output: OutputMode) -> Result<ExitCode> {
    let (_, store) = super::open_existing(db)?;
    let operations = store.operations_after(None)?;
    let baselines = store.all_baselines()?;
    let meta = [
        (META_REPLICA_ID, store.meta(META_REPLICA_ID)?),
        (META_GLOBAL_ACK, store.meta(META_GLOBAL_ACK)?),
        (META_CONFIRMED_THROUGH, store.meta(META_CONFIRMED_THROUGH)?),
    ];

    let problems = check_history(&operations, &baselines, &meta);
    for problem in &problems {
        warn!(code = problem.code, subject = %problem.subject, "{}", problem.detail);
    }
    let out = VerifyOutput {
        operations: operations.len(),
        baselines: baselines.len(),
        ok: problems.is_empty(),
        problems,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            for problem in &out.problems {
                writeln!(w, "problem code={} subject={} {}", problem.code, problem.subject, problem.detail)?;
            }
            writeln!(
                w,
                "verify ok={} operations={} baselines={} problems={}",
                out.ok,
                out.operations,
                out.baselines,
                out.problems.len()
            )
        },
        |out, w| {
            pretty_section(w, "Verify")?;
            pretty_kv(w, "Operations", out.operations.to_string())?;
            pretty_kv(w, "Baselines", out.baselines.to_string())?;
            if out.ok {
                pretty_kv(w, "Result", "ok")?;
                return Ok(());
            }
            pretty_kv(w, "Problems", out.problems.len().to_string())?;
            writeln!(w)?;
            for problem in &out.problems {
                writeln!(w, "[{}] {}: {}", problem.code, problem.subject, problem.detail)?;
            }
            Ok(())
        },
    )?;

    Ok(if out.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
