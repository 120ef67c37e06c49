//! Init gate.
//!
//! Readiness is negotiated once, lazily, on the first request that needs
//! it. Every job awaits the gate before executing; concurrent first
//! requests share the single negotiation, and exactly one `Ready` event is
//! emitted no matter how many `Init` requests arrive. A failed negotiation
//! still resolves the gate (to "no runtime") so the builtin interpreter
//! can serve requests degraded rather than wedging the queue.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, OnceCell};
use tracing::{info, warn};

use crate::protocol::Event;
use crate::sandbox::installer::PackageInstaller;
use crate::sandbox::SandboxRuntime;

/// The (at most one) runtime negotiation, boxed so tests can inject an
/// arbitrary outcome without touching wasmtime or the network.
pub type Negotiation = BoxFuture<'static, Option<Arc<dyn SandboxRuntime>>>;

pub struct InitGate {
    cell: OnceCell<Option<Arc<dyn SandboxRuntime>>>,
    negotiation: Mutex<Option<Negotiation>>,
    events: mpsc::Sender<Event>,
    installer: PackageInstaller,
    prewarm_package: String,
}

impl InitGate {
    pub fn new(
        negotiation: Negotiation,
        events: mpsc::Sender<Event>,
        installer: PackageInstaller,
        prewarm_package: String,
    ) -> Self {
        Self {
            cell: OnceCell::new(),
            negotiation: Mutex::new(Some(negotiation)),
            events,
            installer,
            prewarm_package,
        }
    }

    /// Resolves once the broker is ready, returning the negotiated runtime
    /// (None = degraded, builtin interpreter only). First caller runs the
    /// negotiation; everyone else waits on the same cell.
    pub async fn ensure_ready(&self) -> Option<Arc<dyn SandboxRuntime>> {
        self.cell
            .get_or_init(|| async {
                let pending = self
                    .negotiation
                    .lock()
                    .expect("init gate poisoned")
                    .take();
                let runtime = match pending {
                    Some(negotiation) => negotiation.await,
                    None => None,
                };

                match &runtime {
                    Some(rt) => {
                        info!("sandbox runtime negotiated");
                        self.spawn_prewarm(rt.clone());
                    }
                    None => warn!("running degraded: builtin interpreter only"),
                }

                // Exactly one Ready per broker lifetime.
                let _ = self.events.send(Event::Ready).await;
                runtime
            })
            .await
            .clone()
    }

    /// Detached, best-effort warm-up install. Readiness never waits on it.
    fn spawn_prewarm(&self, runtime: Arc<dyn SandboxRuntime>) {
        if self.prewarm_package.is_empty() {
            return;
        }
        let installer = self.installer.clone();
        let package = self.prewarm_package.clone();
        tokio::spawn(async move {
            match installer.install(&runtime, &package).await {
                Ok(_) => info!("prewarmed package {package}"),
                Err(e) => warn!("prewarm of {package} failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::sandbox::installer::ImageFetcher;
    use crate::sandbox::testutil::FakeRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct StaticFetcher;

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
            Ok(b"\0asm-image".to_vec())
        }
    }

    fn gate_with(
        runtime: Option<Arc<FakeRuntime>>,
        prewarm: &str,
    ) -> (Arc<InitGate>, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let negotiation: Negotiation = Box::pin(async move {
            runtime.map(|rt| rt as Arc<dyn SandboxRuntime>)
        });
        let installer =
            PackageInstaller::with_fetcher(RegistryConfig::default(), Arc::new(StaticFetcher));
        (
            Arc::new(InitGate::new(
                negotiation,
                events_tx,
                installer,
                prewarm.to_string(),
            )),
            events_rx,
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_negotiation_and_one_ready() {
        let (gate, mut events) = gate_with(Some(Arc::new(FakeRuntime::default())), "");

        let (a, b) = tokio::join!(gate.ensure_ready(), gate.ensure_ready());
        assert!(a.is_some());
        assert!(b.is_some());

        assert_eq!(events.recv().await, Some(Event::Ready));
        assert!(events.try_recv().is_err(), "Ready must be sent once");
    }

    #[tokio::test]
    async fn test_failed_negotiation_still_becomes_ready() {
        let (gate, mut events) = gate_with(None, "");
        assert!(gate.ensure_ready().await.is_none());
        assert_eq!(events.recv().await, Some(Event::Ready));

        // A later caller gets the memoized outcome, no second Ready.
        assert!(gate.ensure_ready().await.is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prewarm_runs_detached() {
        let runtime = Arc::new(FakeRuntime::default());
        let (gate, mut events) = gate_with(Some(runtime.clone()), "demo/warm");

        gate.ensure_ready().await;
        assert_eq!(events.recv().await, Some(Event::Ready));

        // Prewarm is detached; give it a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.prepares.load(Ordering::SeqCst), 1);
    }
}
