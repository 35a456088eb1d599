//! Subcommand implementations

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Serialize;
use tokio::process::Command as ChildCommand;
use tracing::{info, warn};
use warden_lock::{
    DurationSpec, ExecutionGuard, ExecutionPolicy, LockCoordinator, ReleaseDisposition,
};

use crate::model::{AppConfig, RunArgs};
use crate::startup::{ShutdownSignal, run_with_shutdown};

/// A child process to run under the lock
#[derive(Debug, Clone)]
pub struct Invocation {
    pub segment: Option<String>,
    pub argv: Vec<String>,
}

/// Parse a TTL given on the command line
pub fn parse_ttl(raw: Option<&str>) -> anyhow::Result<Option<DurationSpec>> {
    raw.map(str::parse::<DurationSpec>)
        .transpose()
        .context("invalid --ttl")
}

pub fn execution_policy(args: &RunArgs) -> anyhow::Result<ExecutionPolicy<Invocation>> {
    let mut policy = ExecutionPolicy::new(args.key.clone())
        .throw_if_unable_to_acquire(args.throw)
        .key_from_args(|invocation: &Invocation| invocation.segment.clone());
    if let Some(ttl) = parse_ttl(args.ttl.as_deref())? {
        policy = policy.ttl(ttl);
    }
    if let Some(release) = args.release_override() {
        policy = policy.release_after_execution(release);
    }
    Ok(policy)
}

async fn spawn_child(invocation: Invocation) -> anyhow::Result<()> {
    let Some((program, rest)) = invocation.argv.split_first() else {
        bail!("no command given");
    };

    let status = ChildCommand::new(program)
        .args(rest)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to start `{program}`"))?;

    if !status.success() {
        bail!("`{program}` exited with {status}");
    }
    Ok(())
}

/// How a `warden run` invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Executed,
    /// The lock was held elsewhere and the policy said to skip
    Skipped,
    /// Shutdown arrived first; any held lock expires at its TTL
    Interrupted,
}

impl From<RunOutcome> for ExitCode {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Executed | RunOutcome::Skipped => ExitCode::SUCCESS,
            RunOutcome::Interrupted => ExitCode::from(130),
        }
    }
}

/// `warden run`: execute a command while holding the lock
pub async fn run(
    coordinator: Arc<LockCoordinator>,
    args: RunArgs,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<RunOutcome> {
    let guard = ExecutionGuard::new(coordinator, execution_policy(&args)?);
    let invocation = Invocation {
        segment: args.segment,
        argv: args.command,
    };

    match run_with_shutdown(guard.run(invocation, spawn_child), shutdown.subscribe()).await {
        Some(Ok(Some(()))) => Ok(RunOutcome::Executed),
        Some(Ok(None)) => {
            warn!(key = %args.key, "Lock held elsewhere, command skipped");
            Ok(RunOutcome::Skipped)
        }
        Some(Err(e)) => Err(e),
        None => {
            warn!(key = %args.key, "Interrupted, lock left to expire");
            Ok(RunOutcome::Interrupted)
        }
    }
}

/// `warden resolve-ttl`: print the TTL a lock would get
pub fn resolve_ttl(config: &AppConfig, spec: Option<&str>) -> anyhow::Result<u64> {
    let spec = parse_ttl(spec)?;
    let ttl_ms = config.lock.duration_resolver().resolve(spec.as_ref())?;
    Ok(ttl_ms)
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub resource: String,
    pub nodes: usize,
    pub quorum: usize,
    pub granted: usize,
    pub attempts: u32,
    pub validity_ms: u64,
    pub released: usize,
}

/// `warden probe`: acquire and release a lock to check quorum health
pub async fn probe(coordinator: &LockCoordinator, key: &str) -> anyhow::Result<ProbeReport> {
    let lock = coordinator.acquire_lock([key], None).await?;
    let validity_ms = lock.remaining_validity().as_millis() as u64;

    let released = match coordinator.release_lock(&lock, Some(true)).await {
        ReleaseDisposition::Released(outcome) => outcome.released,
        ReleaseDisposition::Retained => 0,
    };

    let report = ProbeReport {
        resource: lock.resource().to_string(),
        nodes: coordinator.store().nodes().len(),
        quorum: coordinator.store().quorum(),
        granted: lock.granted_nodes().len(),
        attempts: lock.attempts(),
        validity_ms,
        released,
    };
    info!(resource = %report.resource, granted = report.granted, "Probe succeeded");
    Ok(report)
}

pub fn render_probe(report: &ProbeReport, json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string(report)?);
    }
    Ok(format!(
        "{}: granted by {}/{} nodes (quorum {}), {} attempt(s), {} ms validity, released on {}",
        report.resource,
        report.granted,
        report.nodes,
        report.quorum,
        report.attempts,
        report.validity_ms,
        report.released
    ))
}
