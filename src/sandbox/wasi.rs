//! WASI sandbox runtime backed by wasmtime.
//!
//! One shared `Engine` with epoch interruption; a ticker thread increments
//! the epoch every 100 ms. Each execution gets its own `Store` with a
//! memory cap, in-memory stdio pipes, and an epoch-deadline callback that
//! checks the execution's kill switch. Firing the switch traps the guest
//! within one tick, which is what makes cancellation and timeouts work
//! without a thread per process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wasmtime::{Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, UpdateDeadline};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1::{add_to_linker_sync, WasiP1Ctx};
use wasmtime_wasi::I32Exit;

use super::{Artifact, ExecHandle, ExecOutput, KillSwitch, SandboxError, SandboxRuntime};
use crate::config::SandboxConfig;

/// Epoch tick period; kill/timeout latency is bounded by one tick.
const EPOCH_TICK_MS: u64 = 100;

/// How often live output is drained from the guest's memory pipes.
const OUTPUT_POLL_MS: u64 = 50;

/// Hard cap on bytes a guest may write to stdout or stderr (16 MiB).
const MAX_GUEST_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Store data combining the WASI context and resource limiter.
struct StoreData {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

pub struct WasiRuntime {
    engine: Engine,
    shell_module: Module,
    memory_limit_bytes: usize,
}

impl WasiRuntime {
    /// Host-primitive probe: the sandbox is only usable if an engine with
    /// epoch interruption can be built on this host.
    pub fn probe() -> Result<Engine, SandboxError> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        config.max_wasm_stack(1 << 20); // 1 MiB guest stack
        Engine::new(&config).map_err(|e| SandboxError::Probe(e.to_string()))
    }

    /// Runtime-level setup: compile the shell image and smoke-instantiate
    /// it once so import resolution failures surface at init, not at the
    /// first command.
    pub async fn setup(
        engine: Engine,
        shell_image: Vec<u8>,
        memory_limit_mib: u64,
    ) -> Result<Self, SandboxError> {
        let compile_engine = engine.clone();
        let shell_module = tokio::task::spawn_blocking(move || {
            let module = Module::new(&compile_engine, &shell_image)
                .map_err(|e| SandboxError::ImageLoad(format!("compile failed: {e}")))?;
            smoke_instantiate(&compile_engine, &module)?;
            Ok::<_, SandboxError>(module)
        })
        .await
        .map_err(|e| SandboxError::ImageLoad(format!("setup task panicked: {e}")))??;

        // Ticker thread driving epoch interruption for the whole runtime.
        let ticker = engine.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(EPOCH_TICK_MS));
            ticker.increment_epoch();
        });

        info!("WASI runtime ready (shell image compiled)");
        Ok(Self {
            engine,
            shell_module,
            memory_limit_bytes: (memory_limit_mib as usize) * 1024 * 1024,
        })
    }

    fn spawn_module(&self, module: Module, argv: Vec<String>) -> ExecHandle {
        let kill = KillSwitch::new();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let stdout_pipe = MemoryOutputPipe::new(MAX_GUEST_OUTPUT_BYTES);
        let stderr_pipe = MemoryOutputPipe::new(MAX_GUEST_OUTPUT_BYTES);

        let engine = self.engine.clone();
        let memory_limit = self.memory_limit_bytes;
        let guest_kill = kill.clone();
        let guest_out = stdout_pipe.clone();
        let guest_err = stderr_pipe.clone();
        let mut guest = tokio::task::spawn_blocking(move || {
            run_guest_sync(
                &engine,
                &module,
                &argv,
                guest_out,
                guest_err,
                memory_limit,
                guest_kill,
            )
        });

        // Poller: forward new pipe bytes as chunks while the guest runs,
        // final drain on completion, then resolve the exit code.
        tokio::spawn(async move {
            let mut out_seen = 0usize;
            let mut err_seen = 0usize;
            loop {
                let finished = tokio::select! {
                    result = &mut guest => Some(result),
                    _ = tokio::time::sleep(Duration::from_millis(OUTPUT_POLL_MS)) => None,
                };
                forward_new_bytes(&stdout_pipe, &mut out_seen, &stdout_tx);
                forward_new_bytes(&stderr_pipe, &mut err_seen, &stderr_tx);
                if let Some(result) = finished {
                    let code = match result {
                        Ok(code) => code,
                        Err(e) => {
                            warn!("guest execution task failed: {e}");
                            1
                        }
                    };
                    drop(stdout_tx);
                    drop(stderr_tx);
                    let _ = exit_tx.send(code);
                    return;
                }
            }
        });

        ExecHandle {
            kill,
            // Memory stdin pipes are fixed at instantiation; WriteStdin to
            // a WASI execution is logged as unsupported by the registry.
            stdin: None,
            output: ExecOutput::Streamed {
                stdout: stdout_rx,
                stderr: stderr_rx,
                exit: exit_rx,
            },
        }
    }
}

fn forward_new_bytes(
    pipe: &MemoryOutputPipe,
    seen: &mut usize,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
) {
    let contents = pipe.contents();
    if contents.len() > *seen {
        let _ = tx.send(contents[*seen..].to_vec());
        *seen = contents.len();
    }
}

/// Runs a WASI command module to completion on the current (blocking)
/// thread. Returns the guest exit code; a fired kill switch maps to 137.
fn run_guest_sync(
    engine: &Engine,
    module: &Module,
    argv: &[String],
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    memory_limit_bytes: usize,
    kill: KillSwitch,
) -> i32 {
    let mut builder = WasiCtxBuilder::new();
    builder.args(argv);
    builder.stdin(MemoryInputPipe::new(Vec::new()));
    builder.stdout(stdout).stderr(stderr);
    let wasi = builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(memory_limit_bytes)
        .instances(1)
        .build();

    let mut store = Store::new(engine, StoreData { wasi, limits });
    store.limiter(|data| &mut data.limits);
    store.set_epoch_deadline(1);
    let watch = kill.clone();
    store.epoch_deadline_callback(move |_ctx| {
        if watch.is_killed() {
            Err(anyhow::anyhow!("execution killed"))
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    let mut linker: Linker<StoreData> = Linker::new(engine);
    if let Err(e) = add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi) {
        warn!("failed to link WASI: {e}");
        return 1;
    }

    let instance = match linker.instantiate(&mut store, module) {
        Ok(instance) => instance,
        Err(e) => {
            warn!("failed to instantiate guest: {e}");
            return 1;
        }
    };

    let start = match instance.get_typed_func::<(), ()>(&mut store, "_start") {
        Ok(start) => start,
        Err(e) => {
            warn!("guest missing _start: {e}");
            return 1;
        }
    };

    match start.call(&mut store, ()) {
        Ok(()) => 0,
        Err(trap) => {
            if let Some(exit) = trap.downcast_ref::<I32Exit>() {
                exit.0
            } else if kill.is_killed() {
                137
            } else {
                debug!("guest trapped: {trap}");
                1
            }
        }
    }
}

/// Instantiates the module once with a throwaway store to verify imports.
fn smoke_instantiate(engine: &Engine, module: &Module) -> Result<(), SandboxError> {
    let wasi = WasiCtxBuilder::new().build_p1();
    let limits = StoreLimitsBuilder::new().instances(1).build();
    let mut store = Store::new(engine, StoreData { wasi, limits });
    store.set_epoch_deadline(u64::MAX);
    let mut linker: Linker<StoreData> = Linker::new(engine);
    add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(|e| SandboxError::ImageLoad(format!("WASI link failed: {e}")))?;
    linker
        .instantiate(&mut store, module)
        .map_err(|e| SandboxError::ImageLoad(format!("instantiation failed: {e}")))?;
    Ok(())
}

#[async_trait::async_trait]
impl SandboxRuntime for WasiRuntime {
    async fn prepare(&self, name: &str, image: Vec<u8>) -> Result<Artifact, SandboxError> {
        let engine = self.engine.clone();
        let package = name.to_string();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &image))
            .await
            .map_err(|e| SandboxError::Install {
                package: package.clone(),
                message: format!("compile task panicked: {e}"),
            })?
            .map_err(|e| SandboxError::Install {
                package: package.clone(),
                message: format!("compile failed: {e}"),
            })?;
        Ok(Artifact::new(name, Arc::new(module)))
    }

    async fn spawn_program(&self, cmd: &str) -> Result<ExecHandle, SandboxError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), cmd.to_string()];
        Ok(self.spawn_module(self.shell_module.clone(), argv))
    }

    async fn spawn_package(
        &self,
        artifact: &Artifact,
        args: &[String],
    ) -> Result<ExecHandle, SandboxError> {
        let module = artifact
            .downcast::<Module>()
            .ok_or_else(|| SandboxError::Spawn(format!(
                "artifact {} was not prepared by this runtime",
                artifact.name
            )))?
            .clone();
        let entry = artifact
            .name
            .rsplit('/')
            .next()
            .unwrap_or(&artifact.name)
            .to_string();
        let mut argv = vec![entry];
        argv.extend_from_slice(args);
        Ok(self.spawn_module(module, argv))
    }
}

/// Negotiates sandbox availability: probe the host primitive, fetch the
/// shell image (local path first, then mirrors in order), then set the
/// runtime up under a bounded timeout. Every failure degrades to `None`
/// ("sandbox unavailable"); nothing here is fatal to the broker.
pub async fn negotiate(config: SandboxConfig) -> Option<Arc<dyn SandboxRuntime>> {
    let engine = match WasiRuntime::probe() {
        Ok(engine) => engine,
        Err(e) => {
            warn!("sandbox unavailable: {e}");
            return None;
        }
    };

    let image = match load_shell_image(&config).await {
        Ok(image) => image,
        Err(e) => {
            warn!("sandbox unavailable: {e}");
            return None;
        }
    };

    let setup = WasiRuntime::setup(engine, image, config.memory_limit_mib);
    match tokio::time::timeout(Duration::from_secs(config.setup_timeout_secs), setup).await {
        Ok(Ok(runtime)) => Some(Arc::new(runtime)),
        Ok(Err(e)) => {
            warn!("sandbox unavailable: setup failed: {e}");
            None
        }
        Err(_) => {
            warn!(
                "sandbox unavailable: setup exceeded {}s",
                config.setup_timeout_secs
            );
            None
        }
    }
}

/// Loads the shell program image: local trusted path first, then each
/// configured mirror in preference order. First success wins.
async fn load_shell_image(config: &SandboxConfig) -> Result<Vec<u8>, SandboxError> {
    match tokio::fs::read(&config.shell_image).await {
        Ok(bytes) => {
            debug!(
                "loaded shell image from {} ({} bytes)",
                config.shell_image.display(),
                bytes.len()
            );
            return Ok(bytes);
        }
        Err(e) => {
            debug!(
                "local shell image {} unavailable: {e}",
                config.shell_image.display()
            );
        }
    }

    for mirror in &config.image_mirrors {
        match fetch_image(mirror).await {
            Ok(bytes) => {
                info!("loaded shell image from mirror {mirror} ({} bytes)", bytes.len());
                return Ok(bytes);
            }
            Err(e) => warn!("shell image mirror {mirror} failed: {e}"),
        }
    }

    Err(SandboxError::ImageLoad(format!(
        "no usable source: tried {} and {} mirror(s)",
        Path::new(&config.shell_image).display(),
        config.image_mirrors.len()
    )))
}

async fn fetch_image(url: &str) -> Result<Vec<u8>, String> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;

    #[test]
    fn test_probe_builds_an_engine() {
        assert!(WasiRuntime::probe().is_ok());
    }

    #[tokio::test]
    async fn test_negotiate_degrades_without_image() {
        // No local image, no mirrors: negotiation must conclude with
        // "unavailable", not an error.
        let config = SandboxConfig {
            shell_image: "/nonexistent/shell.wasm".into(),
            image_mirrors: vec![],
            ..SandboxConfig::default()
        };
        assert!(negotiate(config).await.is_none());
    }

    #[tokio::test]
    async fn test_setup_rejects_garbage_image() {
        let engine = WasiRuntime::probe().unwrap();
        let result = WasiRuntime::setup(engine, b"not a wasm module".to_vec(), 64).await;
        assert!(matches!(result, Err(SandboxError::ImageLoad(_))));
    }

    #[tokio::test]
    async fn test_minimal_wasi_guest_runs_and_exits_zero() {
        // Smallest possible WASI command: exports _start, does nothing.
        let wat = r#"(module
            (memory (export "memory") 1)
            (func (export "_start")))"#;
        let engine = WasiRuntime::probe().unwrap();
        // Module::new accepts the text format directly (wasmtime's default
        // `wat` feature).
        let runtime = WasiRuntime::setup(engine, wat.as_bytes().to_vec(), 64)
            .await
            .unwrap();
        let handle = runtime.spawn_program("anything").await.unwrap();
        match handle.output {
            ExecOutput::Streamed { exit, .. } => {
                let code = tokio::time::timeout(Duration::from_secs(5), exit)
                    .await
                    .expect("guest should finish")
                    .expect("exit code should arrive");
                assert_eq!(code, 0);
            }
            ExecOutput::Buffered(_) => panic!("WASI handles stream"),
        }
    }
}
