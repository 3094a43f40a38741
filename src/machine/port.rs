use crate::machine::config::MachineError;
use std::fmt;
use std::net::{TcpListener, UdpSocket};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One host-to-guest forwarding rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMap {
    pub host: u16,
    pub guest: u16,
    pub protocol: Protocol,
}

impl PortMap {
    pub fn tcp(host: u16, guest: u16) -> Self {
        PortMap {
            host,
            guest,
            protocol: Protocol::Tcp,
        }
    }

    /// Rule in the emulator's user-network syntax, `hostfwd=tcp::8080-:80`.
    pub fn hostfwd(&self) -> String {
        format!("hostfwd={}::{}-:{}", self.protocol, self.host, self.guest)
    }
}

/// Parses `"8080,53u,2222:22"` style lists; a `u` suffix selects UDP, `t` is accepted for TCP.
pub fn parse_ports(spec: &str) -> Result<Vec<PortMap>, MachineError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',').map(parse_one).collect()
}

fn parse_one(item: &str) -> Result<PortMap, MachineError> {
    let item = item.trim();
    let (body, protocol) = if let Some(body) = item.strip_suffix('u') {
        (body, Protocol::Udp)
    } else if let Some(body) = item.strip_suffix('t') {
        (body, Protocol::Tcp)
    } else {
        (item, Protocol::Tcp)
    };

    let (host, guest) = match body.split_once(':') {
        Some((host, guest)) => (parse_number(host, item)?, parse_number(guest, item)?),
        None => {
            let port = parse_number(body, item)?;
            (port, port)
        }
    };

    Ok(PortMap {
        host,
        guest,
        protocol,
    })
}

fn parse_number(value: &str, item: &str) -> Result<u16, MachineError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MachineError::InvalidPort(format!(
            "{:?} must be <port>[u] or <host>:<guest>[u]",
            item
        )));
    }
    match value.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(MachineError::InvalidPort(format!(
            "{:?}: ports must be between 1 and 65535",
            item
        ))),
    }
}

/// Binds a throwaway socket on `map.host` to prove the port is free.
pub fn check_available(map: &PortMap) -> Result<(), MachineError> {
    let bound = match map.protocol {
        Protocol::Tcp => TcpListener::bind(("0.0.0.0", map.host)).map(drop),
        Protocol::Udp => UdpSocket::bind(("0.0.0.0", map.host)).map(drop),
    };
    bound.map_err(|_| MachineError::PortInUse(map.host))
}
