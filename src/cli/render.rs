use crate::kvm::qemu::RunStatus;
use crate::machine::config::{MachineConfig, NetworkMode};
use serde_json::{Value, json};
use std::fmt::Write;

const LIST_HEADER: [&str; 8] = ["NAME", "OS", "STATUS", "SSH", "PORTS", "ARCH", "PID", "TAGS"];

/// One line of `pinevm list`.
pub struct ListRow {
    cells: [String; 8],
}

impl ListRow {
    pub fn new(config: &MachineConfig, status: RunStatus, pid: Option<i32>) -> Self {
        let ssh = match config.network {
            NetworkMode::User => config.ssh_port.to_string(),
            NetworkMode::Bridged if config.machine_ip.is_empty() => "-".to_string(),
            NetworkMode::Bridged => format!("{}:22", config.machine_ip),
        };
        ListRow {
            cells: [
                config.alias.clone(),
                config.os().to_string(),
                status.to_string(),
                ssh,
                or_dash(config.port.clone()),
                config.arch.to_string(),
                pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                or_dash(tag_list(config)),
            ],
        }
    }

    /// Row for an instance whose configuration cannot be read.
    pub fn broken(alias: &str) -> Self {
        let mut cells: [String; 8] = Default::default();
        cells[0] = alias.to_string();
        cells[2] = "Broken".to_string();
        for cell in cells.iter_mut().skip(1) {
            if cell.is_empty() {
                *cell = "-".to_string();
            }
        }
        ListRow { cells }
    }
}

fn or_dash(value: String) -> String {
    if value.is_empty() { "-".to_string() } else { value }
}

fn tag_list(config: &MachineConfig) -> String {
    config.tags.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Left-aligned table with columns sized to the widest cell.
pub fn list_table(rows: &[ListRow]) -> String {
    let mut widths: Vec<usize> = LIST_HEADER.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(&row.cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = LIST_HEADER.iter().map(|h| h.to_string()).collect();
    for cells in std::iter::once(&header[..]).chain(rows.iter().map(|r| &r.cells[..])) {
        let line: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out
}

pub fn info_text(config: &MachineConfig, status: RunStatus, pid: Option<i32>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Name:     {}", config.alias);
    let _ = writeln!(out, "Status:   {}", status);
    if let Some(pid) = pid {
        let _ = writeln!(out, "PID:      {}", pid);
    }
    let _ = writeln!(out, "Image:    {}", config.image);
    let _ = writeln!(out, "Arch:     {}", config.arch);
    let _ = writeln!(out, "CPUs:     {}", config.cpu);
    let _ = writeln!(out, "Memory:   {} MB", config.memory);
    let _ = writeln!(out, "Disk:     {}", config.disk);
    let _ = writeln!(out, "Network:  {}", config.network);
    if !config.machine_ip.is_empty() {
        let _ = writeln!(out, "Address:  {}", config.machine_ip);
    }
    let _ = writeln!(out, "SSH port: {}", config.ssh_port);
    let _ = writeln!(out, "Ports:    {}", or_dash(config.port.clone()));
    let _ = writeln!(out, "MAC:      {}", config.mac_address);
    if let Some(mount) = &config.mount {
        let _ = writeln!(out, "Mount:    {}", mount.display());
    }
    let _ = writeln!(out, "Tags:     {}", or_dash(tag_list(config)));
    let _ = writeln!(out, "Location: {}", config.location.display());
    out
}

/// The stored document plus live status. Passwords are left out.
pub fn info_json(config: &MachineConfig, status: RunStatus, pid: Option<i32>) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        map.remove("ssh_password");
        map.remove("root_password");
        map.insert("status".to_string(), json!(status.to_string()));
        map.insert("pid".to_string(), json!(pid));
    }
    Ok(value)
}
