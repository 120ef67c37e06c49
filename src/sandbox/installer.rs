//! Package cache & installer.
//!
//! Resolves registry package names to runnable artifacts, on demand. Installs
//! are memoized per name with single-flight semantics: concurrent requests
//! for the same uncached package share one download + compile, and all
//! callers observe the same result. A failed install is evicted so a later
//! request can retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{Artifact, SandboxError, SandboxRuntime};
use crate::config::RegistryConfig;

/// Fetches raw package images. Split out of the installer so tests can
/// count and script downloads without an HTTP server.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Production fetcher: plain GET against the registry CDN.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

type InstallSlot = Arc<OnceCell<Result<Artifact, String>>>;

#[derive(Clone)]
pub struct PackageInstaller {
    config: RegistryConfig,
    fetcher: Arc<dyn ImageFetcher>,
    cache: Arc<Mutex<HashMap<String, InstallSlot>>>,
}

impl PackageInstaller {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_fetcher(config, Arc::new(HttpFetcher::new()))
    }

    pub fn with_fetcher(config: RegistryConfig, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            config,
            fetcher,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Installs a package (or returns the cached artifact). The boolean is
    /// true when the artifact was already cached before this call.
    pub async fn install(
        &self,
        runtime: &Arc<dyn SandboxRuntime>,
        name: &str,
    ) -> Result<(Artifact, bool), SandboxError> {
        let slot = {
            let mut cache = self.cache.lock().expect("package cache poisoned");
            cache
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let was_cached = matches!(slot.get(), Some(Ok(_)));

        let result = slot
            .get_or_init(|| self.fetch_and_prepare(runtime, name))
            .await;

        match result {
            Ok(artifact) => Ok((artifact.clone(), was_cached)),
            Err(message) => {
                // Evict the failed flight (only if the slot still holds it)
                // so a later request retries instead of replaying the error.
                let mut cache = self.cache.lock().expect("package cache poisoned");
                if let Some(current) = cache.get(name) {
                    if Arc::ptr_eq(current, &slot) {
                        cache.remove(name);
                    }
                }
                Err(SandboxError::Install {
                    package: name.to_string(),
                    message: message.clone(),
                })
            }
        }
    }

    async fn fetch_and_prepare(
        &self,
        runtime: &Arc<dyn SandboxRuntime>,
        name: &str,
    ) -> Result<Artifact, String> {
        let url = self.config.package_url(name);
        let budget = Duration::from_secs(self.config.install_timeout_secs);
        debug!("installing package {name} from {url}");

        let install = async {
            let image = self.fetcher.fetch(&url).await?;
            let digest = hex::encode(Sha256::digest(&image));
            info!("package {name}: {} bytes, sha256 {digest}", image.len());
            runtime
                .prepare(name, image)
                .await
                .map_err(|e| e.to_string())
        };

        match tokio::time::timeout(budget, install).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "install timed out after {}s",
                self.config.install_timeout_secs
            )),
        }
    }

    /// Snapshot of installed package names (insertion order irrelevant).
    pub fn list(&self) -> Vec<String> {
        let cache = self.cache.lock().expect("package cache poisoned");
        let mut names: Vec<String> = cache
            .iter()
            .filter(|(_, slot)| matches!(slot.get(), Some(Ok(_))))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::FakeRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                fail,
            })
        }
    }

    #[async_trait]
    impl ImageFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(format!("404 for {url}"))
            } else {
                Ok(b"\0asm-image".to_vec())
            }
        }
    }

    fn runtime() -> Arc<dyn SandboxRuntime> {
        Arc::new(FakeRuntime::default())
    }

    fn installer(fetcher: Arc<dyn ImageFetcher>) -> PackageInstaller {
        PackageInstaller::with_fetcher(RegistryConfig::default(), fetcher)
    }

    #[tokio::test]
    async fn test_sequential_installs_hit_cache() {
        let fetcher = CountingFetcher::new(0, false);
        let installer = installer(fetcher.clone());
        let rt = runtime();

        let (a, cached) = installer.install(&rt, "demo/pkg").await.unwrap();
        assert!(!cached);
        assert_eq!(a.name, "demo/pkg");

        let (_, cached) = installer.install(&rt, "demo/pkg").await.unwrap();
        assert!(cached);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_installs_collapse_to_one() {
        let fetcher = CountingFetcher::new(50, false);
        let installer = installer(fetcher.clone());
        let rt = runtime();

        let (r1, r2) = tokio::join!(
            installer.install(&rt, "demo/pkg"),
            installer.install(&rt, "demo/pkg"),
        );
        assert!(r1.is_ok());
        assert!(r2.is_ok());
        // Exactly one underlying download, regardless of caller count.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_retriable() {
        let failing = CountingFetcher::new(0, true);
        let installer = installer(failing.clone());
        let rt = runtime();

        let err = installer.install(&rt, "demo/pkg").await.unwrap_err();
        assert!(matches!(err, SandboxError::Install { .. }));
        assert!(installer.list().is_empty());

        // The failed slot was evicted: a new attempt fetches again.
        let _ = installer.install(&rt, "demo/pkg").await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_reports_installed_names_only() {
        let installer = installer(CountingFetcher::new(0, false));
        let rt = runtime();
        assert!(installer.list().is_empty());

        installer.install(&rt, "b/two").await.unwrap();
        installer.install(&rt, "a/one").await.unwrap();
        assert_eq!(installer.list(), vec!["a/one".to_string(), "b/two".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_respects_timeout() {
        let slow = CountingFetcher::new(120_000, false);
        let config = RegistryConfig {
            install_timeout_secs: 1,
            ..RegistryConfig::default()
        };
        let installer = PackageInstaller::with_fetcher(config, slow);
        let rt = runtime();

        let err = installer.install(&rt, "demo/slow").await.unwrap_err();
        match err {
            SandboxError::Install { message, .. } => {
                assert!(message.contains("timed out"), "got: {message}")
            }
            other => panic!("wrong error: {other}"),
        }
    }
}
