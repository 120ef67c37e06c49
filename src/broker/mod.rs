//! Command dispatcher.
//!
//! [`Broker::spawn`] wires the whole pipeline together and hands back the
//! duplex channel pair: requests in, events out. The dispatcher task
//! pattern-matches every request exhaustively; queueable work goes to the
//! single-worker scheduler, while cancellation and stdin writes act on the
//! process registry immediately. No request can kill the broker: failures
//! become `Error` events or log lines.

pub mod gate;
pub mod pipe;
pub mod queue;
pub mod registry;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::protocol::{Event, Request};
use crate::sandbox::installer::PackageInstaller;
use crate::sandbox::wasi;
use crate::shell::Interpreter;
use gate::{InitGate, Negotiation};
use queue::{Executor, Job, PendingIds};
use registry::ProcessRegistry;

pub struct Broker;

impl Broker {
    /// Starts a broker with the production WASI negotiation.
    pub fn spawn(config: Config) -> (mpsc::Sender<Request>, mpsc::Receiver<Event>) {
        let sandbox_config = config.sandbox.clone();
        let negotiation: Negotiation = Box::pin(wasi::negotiate(sandbox_config));
        Self::spawn_with_negotiator(config, negotiation)
    }

    /// Starts a broker with an injected runtime negotiation (tests use this
    /// to supply a fake runtime, or none, without touching wasmtime).
    pub fn spawn_with_negotiator(
        config: Config,
        negotiation: Negotiation,
    ) -> (mpsc::Sender<Request>, mpsc::Receiver<Event>) {
        let (request_tx, request_rx) = mpsc::channel::<Request>(100);
        let (event_tx, event_rx) = mpsc::channel::<Event>(100);

        let installer = PackageInstaller::new(config.registry.clone());
        let gate = Arc::new(InitGate::new(
            negotiation,
            event_tx.clone(),
            installer.clone(),
            config.sandbox.prewarm_package.clone(),
        ));
        let registry = ProcessRegistry::new();
        let interpreter = Interpreter::new(config.shell.clone());
        let pending = PendingIds::new();

        // Unbounded on purpose: enqueueing never blocks the dispatcher, so
        // CancelExec stays responsive under any backlog.
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        let executor = Arc::new(Executor::new(
            gate.clone(),
            registry.clone(),
            installer,
            interpreter,
            event_tx.clone(),
            pending.clone(),
        ));
        tokio::spawn(executor.run(job_rx));
        tokio::spawn(dispatch_loop(
            request_rx, gate, registry, pending, job_tx, event_tx,
        ));

        info!("broker started");
        (request_tx, event_rx)
    }
}

async fn dispatch_loop(
    mut requests: mpsc::Receiver<Request>,
    gate: Arc<InitGate>,
    registry: ProcessRegistry,
    pending: PendingIds,
    jobs: mpsc::UnboundedSender<Job>,
    events: mpsc::Sender<Event>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Init => {
                // Detached: readiness must not block the dispatcher, and
                // repeat Inits all land on the same gate.
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.ensure_ready().await;
                });
            }

            Request::CancelExec { id } => {
                // Fire-and-forget: the scheduler owns the terminal event and
                // emits the `ExitCode{137}` after the output it forwarded.
                registry.cancel(&id);
            }

            Request::WriteStdin { id, data } => {
                registry.write_stdin(&id, data.into_bytes());
            }

            Request::ExecProgram { id, cmd, timeout_ms } => {
                if !reserve_id(&pending, &id, &events).await {
                    continue;
                }
                let _ = jobs.send(Job::Exec { id, cmd, timeout_ms });
            }

            Request::ExecPackage {
                id,
                package,
                args,
                timeout_ms,
            } => {
                if !reserve_id(&pending, &id, &events).await {
                    continue;
                }
                let _ = jobs.send(Job::ExecPackage {
                    id,
                    package,
                    args,
                    timeout_ms,
                });
            }

            Request::InstallPackage { id, package } => {
                let _ = jobs.send(Job::Install { id, package });
            }

            Request::ListPackages { id } => {
                let _ = jobs.send(Job::List { id });
            }
        }
    }
    debug!("request channel closed, dispatcher stopping");
}

/// Reserves an execution id before enqueueing, rejecting a duplicate with
/// an immediate `Error` instead of queueing it behind the live execution.
/// The reservation covers queued-but-not-started executions, which the
/// registry cannot see; the scheduler releases it after the terminal event.
async fn reserve_id(pending: &PendingIds, id: &str, events: &mpsc::Sender<Event>) -> bool {
    if pending.reserve(id) {
        return true;
    }
    let _ = events
        .send(Event::Error {
            id: Some(id.to_string()),
            message: format!("execution id {id} is already in use"),
        })
        .await;
    false
}
