use crate::config::config::{CACHE_DIR, Settings};
use crate::machine::config::{MachineConfig, MachineError};
use crate::machine::port::parse_ports;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::warn;

pub const MIN_MEMORY_MB: u32 = 256;
pub const MIN_DISK_BYTES: u64 = 1 << 30;

static NAME_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap());
static TAG_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").unwrap());
static DISK_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]+)([KMG])$").unwrap());

pub fn validate_name(name: &str) -> Result<(), MachineError> {
    if name == CACHE_DIR {
        return Err(MachineError::InvalidName(format!(
            "'{}' is reserved",
            CACHE_DIR
        )));
    }
    if name.starts_with('.') {
        return Err(MachineError::InvalidName(
            "name must not begin with '.'".to_string(),
        ));
    }
    if !NAME_FORMAT.is_match(name) {
        return Err(MachineError::InvalidName(format!(
            "{:?}: accepted characters are [A-Za-z0-9], '.', '_' and '-'",
            name
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), MachineError> {
    if !TAG_FORMAT.is_match(tag) {
        return Err(MachineError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

/// Parses `10G`, `512M` or `1048576K` into bytes.
pub fn parse_disk_size(disk: &str) -> Result<u64, MachineError> {
    let invalid = || {
        MachineError::InvalidParameter(format!(
            "disk size {:?} must be a positive integer followed by a K, M or G suffix",
            disk
        ))
    };
    let captures = DISK_FORMAT.captures(disk).ok_or_else(invalid)?;
    let amount: u64 = captures[1].parse().map_err(|_| invalid())?;
    let shift = match &captures[2] {
        "K" => 10,
        "M" => 20,
        _ => 30,
    };
    let bytes = amount.checked_shl(shift).filter(|b| b >> shift == amount);
    match bytes {
        Some(bytes) if bytes > 0 => Ok(bytes),
        _ => Err(invalid()),
    }
}

pub fn validate_disk(disk: &str) -> Result<(), MachineError> {
    if parse_disk_size(disk)? < MIN_DISK_BYTES {
        return Err(MachineError::InvalidParameter(format!(
            "disk size {} is below the 1G minimum",
            disk
        )));
    }
    Ok(())
}

pub fn validate_memory(memory: u32) -> Result<(), MachineError> {
    if memory < MIN_MEMORY_MB {
        return Err(MachineError::InvalidParameter(format!(
            "machine memory must be at least {} MB",
            MIN_MEMORY_MB
        )));
    }
    Ok(())
}

pub fn validate_cpu(cpu: u32) -> Result<(), MachineError> {
    if cpu == 0 {
        return Err(MachineError::InvalidParameter(
            "number of cpus must be a positive integer".to_string(),
        ));
    }
    let host = num_cpus::get();
    if cpu as usize > host {
        warn!("Requested {} cpus but the host only has {}", cpu, host);
    }
    Ok(())
}

pub fn validate_image(image: &str, settings: &Settings) -> Result<(), MachineError> {
    if !settings.images.iter().any(|known| known == image) {
        return Err(MachineError::InvalidParameter(format!(
            "unsupported image {}, available: {}",
            image,
            settings.images.join(", ")
        )));
    }
    Ok(())
}

pub fn validate_mount(mount: &Path) -> Result<(), MachineError> {
    if !mount.is_dir() {
        return Err(MachineError::InvalidParameter(format!(
            "mount directory {} does not exist",
            mount.display()
        )));
    }
    Ok(())
}

pub fn validate_ssh_port(port: u16) -> Result<(), MachineError> {
    if port == 0 {
        return Err(MachineError::InvalidParameter(
            "ssh port must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

/// Checks a whole document, as after a hand edit. `previous` is the last known good copy.
pub fn validate_machine(
    config: &MachineConfig,
    previous: &MachineConfig,
    settings: &Settings,
) -> Result<(), MachineError> {
    validate_name(&config.alias)?;
    if config.alias != previous.alias {
        return Err(MachineError::InvalidParameter(
            "alias cannot be edited, use rename".to_string(),
        ));
    }
    if config.location != settings.root.join(&config.alias) {
        return Err(MachineError::InvalidParameter(format!(
            "location must be {}",
            settings.root.join(&config.alias).display()
        )));
    }
    if config.mac_address != previous.mac_address {
        return Err(MachineError::InvalidParameter(
            "mac_address cannot change for an existing instance".to_string(),
        ));
    }
    let suffix = format!("-{}.qcow2", config.arch);
    let image = config.image.strip_suffix(&suffix).ok_or_else(|| {
        MachineError::InvalidParameter(format!(
            "image {} does not match architecture {}",
            config.image, config.arch
        ))
    })?;
    validate_image(image, settings)?;
    validate_cpu(config.cpu)?;
    validate_memory(config.memory)?;
    validate_disk(&config.disk)?;
    validate_ssh_port(config.ssh_port)?;
    parse_ports(&config.port)?;
    if let Some(mount) = &config.mount {
        validate_mount(mount)?;
    }
    for tag in &config.tags {
        validate_tag(tag)?;
    }
    if !config.location.is_dir() {
        return Err(MachineError::InvalidParameter(
            "location directory does not exist".to_string(),
        ));
    }
    Ok(())
}
