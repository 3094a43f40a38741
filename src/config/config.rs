use crate::kvm::ssh::SSHError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable overriding the instances root.
pub const ROOT_ENV: &str = "PINEVM_HOME";
/// Directory under the root that holds downloaded images and firmware.
pub const CACHE_DIR: &str = "cache";
pub const SETTINGS_FILE: &str = "settings.toml";

// tool-wide settings, one load per invocation
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub root: PathBuf,

    pub image_base_url: String,
    pub images: Vec<String>,
    pub firmware_name: String,
    pub proxy: Option<String>,
    pub dhcp_leases: PathBuf,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub dhcp_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub pidfile_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub restart_delay: Duration,

    pub command_retries: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_backoff: Duration,

    pub ssh: SSHConfig,
}

// ssh config
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SSHConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,

    pub max_retries: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_backoff: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_backoff: Duration,
    pub compression: bool,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub keep_alive_interval: Option<Duration>,
}

impl Default for SSHConfig {
    fn default() -> Self {
        SSHConfig {
            timeout: Duration::from_secs(30),
            max_retries: 10,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(2),
            compression: false,
            keep_alive_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl SSHConfig {
    pub fn validate(&self) -> Result<(), SSHError> {
        if self.max_retries == 0 {
            return Err(SSHError::ConnectionFailed(
                "Max retries must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(SSHError::ConnectionFailed(
                "Timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            root: PathBuf::new(),
            image_base_url: "https://github.com/beringresearch/macpine/releases/download/v.01/"
                .to_string(),
            images: vec![
                "alpine_3.16.0".to_string(),
                "alpine_3.16.0_lxd".to_string(),
                "debian_11.3.0".to_string(),
            ],
            firmware_name: "qemu_efi.fd".to_string(),
            proxy: None,
            dhcp_leases: PathBuf::from("/var/db/dhcpd_leases"),
            dhcp_timeout: Duration::from_secs(120),
            pidfile_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
            command_retries: 5,
            command_backoff: Duration::from_secs(2),
            ssh: SSHConfig::default(),
        }
    }
}

impl Settings {
    /// Loads `settings.toml` from `root`, falling back to the built-in defaults.
    pub fn load(root: PathBuf) -> Settings {
        let mut settings = match load_settings(&root) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                debug!("No settings file under {}, using defaults", root.display());
                Settings::default()
            }
            Err(e) => {
                warn!("Failed to load settings, using hardcoded defaults. Error: {:?}", e);
                Settings::default()
            }
        };
        settings.root = root;
        settings
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }
}

/// `$PINEVM_HOME`, or `~/.pinevm`.
pub fn default_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    let home = dirs::home_dir().context("Failed to resolve the user's home directory")?;
    Ok(home.join(".pinevm"))
}

fn load_settings(root: &Path) -> Result<Option<Settings>> {
    let settings_file = root.join(SETTINGS_FILE);
    if !settings_file.exists() {
        return Ok(None);
    }

    info!("Loading settings from: {:?}", settings_file);

    let content = fs::read_to_string(&settings_file)
        .with_context(|| format!("Failed to read settings file: {:?}", settings_file))?;

    let settings: Settings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {:?}", settings_file))?;

    settings.ssh.validate()?;

    Ok(Some(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.ssh.max_retries, 10);
        assert_eq!(settings.ssh.initial_backoff, settings.ssh.max_backoff);
        assert!(settings.images.contains(&"alpine_3.16.0".to_string()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path().to_path_buf());
        assert_eq!(settings.root, dir.path());
        assert_eq!(settings.cache_dir(), dir.path().join("cache"));
        assert_eq!(settings.command_retries, 5);
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "dhcp_timeout = 5\nproxy = \"http://127.0.0.1:7890\"\n\n[ssh]\nmax_retries = 3\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path().to_path_buf());
        assert_eq!(settings.dhcp_timeout, Duration::from_secs(5));
        assert_eq!(settings.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(settings.ssh.max_retries, 3);
        assert_eq!(settings.ssh.timeout, Duration::from_secs(30));
        assert_eq!(settings.firmware_name, "qemu_efi.fd");
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "[ssh]\nmax_retries = 0\n").unwrap();

        let settings = Settings::load(dir.path().to_path_buf());
        assert_eq!(settings.ssh.max_retries, 10);
    }
}
