//! Sandbox runtime seam.
//!
//! The broker talks to the sandbox through the [`SandboxRuntime`] trait so
//! the scheduler, registry and pipe adapter can be exercised against a fake
//! runtime in tests. The production implementation (wasmtime + WASI) lives
//! in [`wasi`], the package cache in [`installer`].

pub mod installer;
pub mod wasi;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("sandbox probe failed: {0}")]
    Probe(String),

    #[error("shell image unavailable: {0}")]
    ImageLoad(String),

    #[error("package {package}: {message}")]
    Install { package: String, message: String },

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// An installed, runnable program image.
///
/// The payload is type-erased: the WASI runtime keeps a compiled
/// `wasmtime::Module` behind it, a test runtime keeps whatever it likes.
/// Artifacts are immutable once created and cheap to clone.
#[derive(Clone)]
pub struct Artifact {
    pub name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact").field("name", &self.name).finish()
    }
}

/// One-way kill signal shared between a live execution and its registry
/// entry. `kill()` is idempotent; `killed()` resolves for every waiter.
#[derive(Clone, Default)]
pub struct KillSwitch {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves when (or as soon as) the switch has been fired.
    pub async fn killed(&self) {
        loop {
            if self.is_killed() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering the waiter: notify_waiters() only
            // wakes waiters that exist at the time of the call.
            if self.is_killed() {
                return;
            }
            notified.await;
        }
    }
}

/// Whole-run output of an execution that does not stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Output side of a live execution.
pub enum ExecOutput {
    /// Incremental chunks. Both channels close when the process is done;
    /// `exit` resolves afterwards with the exit code.
    Streamed {
        stdout: mpsc::UnboundedReceiver<Vec<u8>>,
        stderr: mpsc::UnboundedReceiver<Vec<u8>>,
        exit: oneshot::Receiver<i32>,
    },
    /// Single resolution at completion.
    Buffered(oneshot::Receiver<BufferedResult>),
}

/// Handle to a live sandboxed execution.
///
/// The registry keeps the kill switch and stdin sink; the pipe adapter
/// consumes the output. A producer must honor the kill switch by closing
/// its output promptly, otherwise cancellation cannot unblock the queue.
pub struct ExecHandle {
    pub kill: KillSwitch,
    pub stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pub output: ExecOutput,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Compiles a downloaded package image into a runnable artifact.
    async fn prepare(&self, name: &str, image: Vec<u8>) -> Result<Artifact, SandboxError>;

    /// Runs a command line through the shell program image.
    async fn spawn_program(&self, cmd: &str) -> Result<ExecHandle, SandboxError>;

    /// Runs a prepared package entrypoint with the given arguments.
    async fn spawn_package(
        &self,
        artifact: &Artifact,
        args: &[String],
    ) -> Result<ExecHandle, SandboxError>;
}

#[cfg(test)]
pub mod testutil {
    //! Fake runtime for broker/installer tests.

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scriptable in-memory runtime.
    ///
    /// `spawn_program` interprets a tiny test vocabulary:
    /// - `emit <text>` — streams `<text>\n` on stdout, exits 0
    /// - `fail <text>` — streams `<text>\n` on stderr, exits 1
    /// - `hang`        — streams `started\n`, then waits for the kill switch
    /// - `hang-noisy`  — like `hang`, but streams `late\n` after the kill
    /// - `cat-stdin`   — echoes the first stdin write back, then exits 0
    /// - anything else — streams the command back, exits 0
    pub struct FakeRuntime {
        pub prepares: AtomicUsize,
        /// Artificial start latency, to widen race windows in tests
        pub spawn_delay: Duration,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self {
                prepares: AtomicUsize::new(0),
                spawn_delay: Duration::from_millis(0),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum Script {
        Emit(String),
        Fail(String),
        Hang,
        HangNoisy,
        EchoStdin,
    }

    fn parse_script(cmd: &str) -> Script {
        match cmd.split_once(' ') {
            Some(("emit", rest)) => Script::Emit(rest.to_string()),
            Some(("fail", rest)) => Script::Fail(rest.to_string()),
            _ if cmd == "hang" => Script::Hang,
            _ if cmd == "hang-noisy" => Script::HangNoisy,
            _ if cmd == "cat-stdin" => Script::EchoStdin,
            _ => Script::Emit(cmd.to_string()),
        }
    }

    impl FakeRuntime {
        pub fn streamed(script: Script, kill: KillSwitch) -> ExecHandle {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (err_tx, err_rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();

            let killer = kill.clone();
            tokio::spawn(async move {
                let code = match script {
                    Script::Emit(text) => {
                        let _ = out_tx.send(format!("{text}\n").into_bytes());
                        0
                    }
                    Script::Fail(text) => {
                        let _ = err_tx.send(format!("{text}\n").into_bytes());
                        1
                    }
                    Script::Hang => {
                        let _ = out_tx.send(b"started\n".to_vec());
                        killer.killed().await;
                        137
                    }
                    Script::HangNoisy => {
                        let _ = out_tx.send(b"started\n".to_vec());
                        killer.killed().await;
                        // In-flight output racing the kill.
                        let _ = out_tx.send(b"late\n".to_vec());
                        137
                    }
                    Script::EchoStdin => {
                        tokio::select! {
                            Some(bytes) = stdin_rx.recv() => {
                                let _ = out_tx.send(bytes);
                                0
                            }
                            _ = killer.killed() => 137,
                        }
                    }
                };
                drop(out_tx);
                drop(err_tx);
                let _ = exit_tx.send(code);
            });

            ExecHandle {
                kill,
                stdin: Some(stdin_tx),
                output: ExecOutput::Streamed {
                    stdout: out_rx,
                    stderr: err_rx,
                    exit: exit_rx,
                },
            }
        }
    }

    #[async_trait]
    impl SandboxRuntime for FakeRuntime {
        async fn prepare(&self, name: &str, image: Vec<u8>) -> Result<Artifact, SandboxError> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(Artifact::new(name, Arc::new(image)))
        }

        async fn spawn_program(&self, cmd: &str) -> Result<ExecHandle, SandboxError> {
            if !self.spawn_delay.is_zero() {
                tokio::time::sleep(self.spawn_delay).await;
            }
            Ok(Self::streamed(parse_script(cmd), KillSwitch::new()))
        }

        async fn spawn_package(
            &self,
            artifact: &Artifact,
            args: &[String],
        ) -> Result<ExecHandle, SandboxError> {
            let text = format!("{}:{}", artifact.name, args.join(","));
            Ok(Self::streamed(Script::Emit(text), KillSwitch::new()))
        }
    }
}
