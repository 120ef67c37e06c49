use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Sandbox runtime negotiation and limits.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Local trusted path for the shell program image, tried first
    #[serde(default = "default_shell_image")]
    pub shell_image: PathBuf,
    /// Remote fallback sources for the shell image, in preference order
    #[serde(default)]
    pub image_mirrors: Vec<String>,
    /// Bound on runtime-level setup (module compile + smoke instantiation)
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
    /// Package pre-warmed after init, best-effort (empty = none)
    #[serde(default = "default_prewarm_package")]
    pub prewarm_package: String,
    /// Guest linear memory cap, in MiB
    #[serde(default = "default_memory_limit_mib")]
    pub memory_limit_mib: u64,
}

/// Package registry access.
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Download URL template; `{name}` is replaced by the package name
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Bound on a single package install (download + compile)
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
}

/// Fallback interpreter identity stubs and package aliases.
#[derive(Debug, Deserialize, Clone)]
pub struct ShellConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// command name → registry package providing it, consulted when a
    /// command is not a builtin (e.g. python = "python/python")
    #[serde(default)]
    pub package_aliases: HashMap<String, String>,
}

fn default_shell_image() -> PathBuf {
    PathBuf::from("./images/shell.wasm")
}

fn default_setup_timeout_secs() -> u64 {
    15
}

fn default_prewarm_package() -> String {
    "sharrattj/coreutils".to_string()
}

fn default_memory_limit_mib() -> u64 {
    64
}

fn default_url_template() -> String {
    "https://registry-cdn.wasmer.io/packages/{name}/latest/module.wasm".to_string()
}

fn default_install_timeout_secs() -> u64 {
    60
}

fn default_user() -> String {
    "wasi".to_string()
}

fn default_hostname() -> String {
    "wasibox".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell_image: default_shell_image(),
            image_mirrors: Vec::new(),
            setup_timeout_secs: default_setup_timeout_secs(),
            prewarm_package: default_prewarm_package(),
            memory_limit_mib: default_memory_limit_mib(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            install_timeout_secs: default_install_timeout_secs(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            hostname: default_hostname(),
            package_aliases: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Resolves the download URL for a package name.
    pub fn package_url(&self, name: &str) -> String {
        self.url_template.replace("{name}", name)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${REGISTRY_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects malformed mirror/registry URLs up front rather than at
    /// first install.
    pub fn validate(&self) -> anyhow::Result<()> {
        for mirror in &self.sandbox.image_mirrors {
            url::Url::parse(mirror)
                .map_err(|e| anyhow::anyhow!("invalid image mirror {mirror}: {e}"))?;
        }
        let probe = self.registry.package_url("probe/probe");
        url::Url::parse(&probe)
            .map_err(|e| anyhow::anyhow!("invalid registry url template: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sandbox.setup_timeout_secs, 15);
        assert_eq!(config.registry.install_timeout_secs, 60);
        assert_eq!(config.shell.hostname, "wasibox");
        assert!(config.sandbox.image_mirrors.is_empty());
    }

    #[test]
    fn test_package_url_substitution() {
        let registry = RegistryConfig {
            url_template: "https://pkgs.example.net/{name}.wasm".to_string(),
            install_timeout_secs: 60,
        };
        assert_eq!(
            registry.package_url("sharrattj/coreutils"),
            "https://pkgs.example.net/sharrattj/coreutils.wasm"
        );
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("WASIBOX_TEST_MIRROR", "https://mirror.example.net");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[sandbox]\nimage_mirrors = [\"${{WASIBOX_TEST_MIRROR}}/shell.wasm\"]"
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            config.sandbox.image_mirrors,
            vec!["https://mirror.example.net/shell.wasm".to_string()]
        );
    }

    #[test]
    fn test_load_rejects_bad_mirror() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\nimage_mirrors = [\"not a url\"]").unwrap();
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sandbox.prewarm_package, "sharrattj/coreutils");
    }

    #[test]
    fn test_package_aliases_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[shell]\n[shell.package_aliases]\npython = \"python/python\""
        )
        .unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            config.shell.package_aliases.get("python").map(String::as_str),
            Some("python/python")
        );
    }
}
