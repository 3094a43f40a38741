use crate::config::config::CACHE_DIR;
use crate::machine::credential::Credential;
use crate::machine::port::{PortMap, parse_ports};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.toml";
pub const PID_FILE: &str = "machine.pid";
pub const SERIAL_SOCKET: &str = "machine.sock";
pub const QMP_SOCKET: &str = "machine.qmp";
pub const SERIAL_LOG: &str = "machine.log";
pub const LOCK_FILE: &str = ".lock";

/// Instance files left out of published archives.
pub const RUNTIME_FILES: [&str; 5] = [PID_FILE, SERIAL_SOCKET, QMP_SOCKET, SERIAL_LOG, LOCK_FILE];

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("unknown instance {0}")]
    NotFound(String),
    #[error("malformed configuration {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("instance {0} already exists")]
    AlreadyExists(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("[{0}] contains characters other than [A-Za-z0-9], '_' and '-'")]
    InvalidTag(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid port mapping: {0}")]
    InvalidPort(String),
    #[error("port {0} is already in use on the host")]
    PortInUse(u16),
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Arch {
    /// Architecture of the machine running this process, if supported as a guest.
    pub fn host() -> Option<Arch> {
        match std::env::consts::ARCH {
            "aarch64" => Some(Arch::Aarch64),
            "x86_64" => Some(Arch::X86_64),
            _ => None,
        }
    }

    pub fn qemu_binary(&self) -> String {
        format!("qemu-system-{}", self)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::X86_64 => write!(f, "x86_64"),
        }
    }
}

impl FromStr for Arch {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            other => Err(MachineError::InvalidParameter(format!(
                "unsupported machine architecture {}, use x86_64 or aarch64",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Emulator user-mode networking with host port forwarding.
    #[default]
    User,
    /// Guest leases an address from the host network by MAC address.
    Bridged,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::User => write!(f, "user"),
            NetworkMode::Bridged => write!(f, "bridged"),
        }
    }
}

/// Persisted descriptor of one instance, stored as `config.toml` in its directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub alias: String,
    pub image: String,
    pub arch: Arch,
    pub cpu: u32,
    pub memory: u32,
    pub disk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<PathBuf>,
    #[serde(default)]
    pub machine_ip: String,
    #[serde(default)]
    pub port: String,
    pub ssh_port: u16,
    pub mac_address: String,
    #[serde(default)]
    pub network: NetworkMode,
    pub ssh_user: String,
    pub ssh_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
    pub location: PathBuf,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MachineConfig {
    pub fn config_file(&self) -> PathBuf {
        self.location.join(CONFIG_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.location.join(PID_FILE)
    }

    pub fn serial_socket(&self) -> PathBuf {
        self.location.join(SERIAL_SOCKET)
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.location.join(QMP_SOCKET)
    }

    pub fn serial_log(&self) -> PathBuf {
        self.location.join(SERIAL_LOG)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.location.join(LOCK_FILE)
    }

    pub fn image_path(&self) -> PathBuf {
        self.location.join(&self.image)
    }

    pub fn firmware_path(&self, firmware_name: &str) -> PathBuf {
        self.location.join(firmware_name)
    }

    /// Image family shown in listings, e.g. `alpine` for `alpine_3.16.0-x86_64.qcow2`.
    pub fn os(&self) -> &str {
        self.image.split('_').next().unwrap_or(&self.image)
    }

    pub fn port_maps(&self) -> Result<Vec<PortMap>, MachineError> {
        parse_ports(&self.port)
    }

    pub fn credential(&self) -> Credential {
        Credential::parse(&self.ssh_password)
    }

    pub fn root_credential(&self) -> Option<Credential> {
        self.root_password.as_deref().map(Credential::parse)
    }

    /// Every host-side port the emulator binds for this instance.
    pub fn host_ports(&self) -> Result<Vec<PortMap>, MachineError> {
        if self.network == NetworkMode::Bridged {
            return Ok(Vec::new());
        }
        let mut ports = vec![PortMap::tcp(self.ssh_port, 22)];
        ports.extend(self.port_maps()?);
        Ok(ports)
    }
}

/// Loads and saves instance documents under the instances root.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn location(&self, alias: &str) -> PathBuf {
        self.root.join(alias)
    }

    pub fn load(&self, alias: &str) -> Result<MachineConfig, MachineError> {
        if !is_instance_name(alias) {
            return Err(MachineError::NotFound(alias.to_string()));
        }
        let path = self.location(alias).join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MachineError::NotFound(alias.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        toml::from_str(&content).map_err(|source| MachineError::Malformed { path, source })
    }

    /// Overwrites the whole document through a temporary file and a rename.
    pub fn save(&self, config: &MachineConfig) -> Result<(), MachineError> {
        let dir = self.location(&config.alias);
        let target = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!("{}.tmp", CONFIG_FILE));

        let content = toml::to_string(config)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(alias = %config.alias, "Saved configuration to {}", target.display());
        Ok(())
    }

    /// Sorted names of every instance directory under the root.
    pub fn list(&self) -> Result<Vec<String>, MachineError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_instance_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_instance_name(name: &str) -> bool {
    !name.is_empty() && name != CACHE_DIR && !name.starts_with('.') && !name.contains('/')
}
