//! Command queue and single-worker scheduler.
//!
//! Jobs are explicit values on an unbounded channel with one consumer task:
//! submission order is start order, and each job runs to its terminal event
//! before the next starts. A slow command therefore blocks later queued
//! commands; cancellation and stdin writes bypass the queue entirely and
//! act on the registry, so they stay responsive under backlog.
//!
//! All events for an execution are emitted from this one task, so ordering
//! is structural: the terminal event goes out only after every output chunk
//! the job forwarded, including anything a cancelled process flushed on its
//! way down.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::gate::InitGate;
use super::pipe::{pump, PumpEnd};
use super::registry::{ProcEntry, ProcessRegistry};
use crate::protocol::Event;
use crate::sandbox::installer::PackageInstaller;
use crate::sandbox::{ExecHandle, KillSwitch, SandboxError, SandboxRuntime};
use crate::shell::{builtins, Interpreter, SandboxAccess};

#[derive(Debug)]
pub enum Job {
    Exec {
        id: String,
        cmd: String,
        timeout_ms: Option<u64>,
    },
    ExecPackage {
        id: String,
        package: String,
        args: Vec<String>,
        timeout_ms: Option<u64>,
    },
    Install {
        id: String,
        package: String,
    },
    List {
        id: String,
    },
}

/// Execution ids reserved from enqueue until the job's terminal event.
///
/// The registry only knows executions that have started; a duplicate id
/// submitted while the first is still queued would slip past it. The
/// dispatcher reserves here before enqueueing and the scheduler releases
/// after the job completes, so the reservation covers the whole window.
#[derive(Clone, Default)]
pub struct PendingIds {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl PendingIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id. False if it is already reserved.
    pub fn reserve(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("pending ids poisoned")
            .insert(id.to_string())
    }

    pub fn release(&self, id: &str) {
        self.inner
            .lock()
            .expect("pending ids poisoned")
            .remove(id);
    }
}

pub struct Executor {
    gate: Arc<InitGate>,
    registry: ProcessRegistry,
    installer: PackageInstaller,
    interpreter: Interpreter,
    events: mpsc::Sender<Event>,
    pending: PendingIds,
}

impl Executor {
    pub fn new(
        gate: Arc<InitGate>,
        registry: ProcessRegistry,
        installer: PackageInstaller,
        interpreter: Interpreter,
        events: mpsc::Sender<Event>,
        pending: PendingIds,
    ) -> Self {
        Self {
            gate,
            registry,
            installer,
            interpreter,
            events,
            pending,
        }
    }

    /// Single consumer loop. Runs until the job channel closes.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let reserved = match &job {
                Job::Exec { id, .. } | Job::ExecPackage { id, .. } => Some(id.clone()),
                Job::Install { .. } | Job::List { .. } => None,
            };
            let runtime = self.gate.ensure_ready().await;
            self.handle(job, runtime).await;
            if let Some(id) = reserved {
                self.pending.release(&id);
            }
        }
        debug!("job channel closed, executor stopping");
    }

    async fn handle(&self, job: Job, runtime: Option<Arc<dyn SandboxRuntime>>) {
        match job {
            Job::Exec { id, cmd, timeout_ms } => match runtime {
                Some(rt) => match rt.spawn_program(&cmd).await {
                    Ok(handle) => self.supervise(&id, handle, timeout_ms).await,
                    Err(e) => self.error(&id, e.to_string()).await,
                },
                None => self.run_fallback(&id, &cmd, timeout_ms, None).await,
            },

            Job::ExecPackage {
                id,
                package,
                args,
                timeout_ms,
            } => {
                let Some(rt) = runtime else {
                    self.exec_package_degraded(&id, &package, &args, timeout_ms)
                        .await;
                    return;
                };
                match self.installer.install(&rt, &package).await {
                    Ok((artifact, _)) => match rt.spawn_package(&artifact, &args).await {
                        Ok(handle) => self.supervise(&id, handle, timeout_ms).await,
                        Err(e) => self.error(&id, e.to_string()).await,
                    },
                    Err(e) => {
                        // A failed install can still be served locally when
                        // the basename names a builtin or a package alias
                        // (e.g. coreutils' echo, or python -> python/python).
                        let base = package.rsplit('/').next().unwrap_or(&package);
                        if self.interpreter.resolves(base) {
                            warn!("install of {package} failed ({e}), resolving {base} locally");
                            let cmd = fallback_command(&package, &args);
                            self.run_fallback(&id, &cmd, timeout_ms, Some((&rt, &self.installer)))
                                .await;
                        } else {
                            self.error(&id, e.to_string()).await;
                        }
                    }
                }
            }

            Job::Install { id, package } => match runtime {
                Some(rt) => match self.installer.install(&rt, &package).await {
                    Ok((_, cached)) => {
                        let _ = self
                            .events
                            .send(Event::PackageInstalled { id, package, cached })
                            .await;
                    }
                    Err(e) => self.error(&id, e.to_string()).await,
                },
                None => {
                    self.error(&id, "sandbox unavailable: cannot install packages".to_string())
                        .await;
                }
            },

            Job::List { id } => {
                let _ = self
                    .events
                    .send(Event::PackageList {
                        id,
                        packages: self.installer.list(),
                    })
                    .await;
            }
        }
    }

    /// Registers a spawned handle and pumps it to its terminal event,
    /// honoring the optional deadline. The terminal is emitted here, after
    /// all forwarded output; cancellation reaches the process through its
    /// kill switch and surfaces as the exit code the producer reports.
    async fn supervise(&self, id: &str, handle: ExecHandle, timeout_ms: Option<u64>) {
        let kill = handle.kill.clone();
        let entry = ProcEntry {
            kill: kill.clone(),
            stdin: handle.stdin.clone(),
        };
        if !self.registry.insert(id, entry) {
            kill.kill();
            self.error(id, format!("execution id {id} is already in use"))
                .await;
            return;
        }

        let pumping = pump(id, handle.output, &self.events);
        let end = match timeout_ms {
            Some(ms) => {
                tokio::select! {
                    end = pumping => end,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        kill.kill();
                        if self.registry.claim(id) {
                            self.error(id, SandboxError::Timeout(ms).to_string()).await;
                        }
                        return;
                    }
                }
            }
            None => pumping.await,
        };

        match end {
            PumpEnd::Complete(code) => {
                if self.registry.claim(id) {
                    let _ = self
                        .events
                        .send(Event::ExitCode {
                            id: id.to_string(),
                            code,
                        })
                        .await;
                }
            }
            PumpEnd::Broken(message) => {
                if self.registry.claim(id) {
                    self.error(id, message).await;
                }
            }
        }
    }

    /// Runs a command line through the builtin interpreter, with the same
    /// registry lifecycle (cancel and timeout) as a sandboxed execution.
    async fn run_fallback(
        &self,
        id: &str,
        cmd: &str,
        timeout_ms: Option<u64>,
        sandbox: Option<SandboxAccess<'_>>,
    ) {
        let kill = KillSwitch::new();
        let entry = ProcEntry {
            kill: kill.clone(),
            stdin: None,
        };
        if !self.registry.insert(id, entry) {
            self.error(id, format!("execution id {id} is already in use"))
                .await;
            return;
        }

        let deadline = async {
            match timeout_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = self.interpreter.run(cmd, sandbox) => {
                if self.registry.claim(id) {
                    if !result.stdout.is_empty() {
                        let _ = self.events.send(Event::Stdout {
                            id: id.to_string(),
                            data: result.stdout,
                        }).await;
                    }
                    if !result.stderr.is_empty() {
                        let _ = self.events.send(Event::Stderr {
                            id: id.to_string(),
                            data: result.stderr,
                        }).await;
                    }
                    let _ = self.events.send(Event::ExitCode {
                        id: id.to_string(),
                        code: result.exit_code,
                    }).await;
                }
            }
            _ = kill.killed() => {
                // Cancelled mid-run; the interpreter future is dropped here,
                // so nothing for this id can follow the terminal.
                if self.registry.claim(id) {
                    let _ = self.events.send(Event::ExitCode {
                        id: id.to_string(),
                        code: 137,
                    }).await;
                }
            }
            _ = deadline => {
                kill.kill();
                if self.registry.claim(id) {
                    self.error(id, SandboxError::Timeout(timeout_ms.unwrap_or(0)).to_string())
                        .await;
                }
            }
        }
    }

    async fn exec_package_degraded(
        &self,
        id: &str,
        package: &str,
        args: &[String],
        timeout_ms: Option<u64>,
    ) {
        if builtin_fallback(package).is_some() {
            let cmd = fallback_command(package, args);
            self.run_fallback(id, &cmd, timeout_ms, None).await;
        } else {
            self.error(
                id,
                format!("sandbox unavailable: cannot run package {package}"),
            )
            .await;
        }
    }

    async fn error(&self, id: &str, message: String) {
        let _ = self
            .events
            .send(Event::Error {
                id: Some(id.to_string()),
                message,
            })
            .await;
    }
}

/// Maps a package name onto a builtin of the same basename, if any.
fn builtin_fallback(package: &str) -> Option<&str> {
    let base = package.rsplit('/').next().unwrap_or(package);
    builtins::is_builtin(base).then_some(base)
}

/// Builds an interpreter command line for a local fallback, quoting each
/// argument so the tokenizer reassembles it verbatim.
fn fallback_command(package: &str, args: &[String]) -> String {
    let base = package.rsplit('/').next().unwrap_or(package);
    let mut cmd = String::from(base);
    for arg in args {
        cmd.push(' ');
        cmd.push('\'');
        cmd.push_str(&arg.replace('\'', r"'\''"));
        cmd.push('\'');
    }
    cmd
}
