//! Address discovery for bridged guests through the host's DHCP lease table.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DhcpError {
    #[error("no DHCP lease for {mac} in {path} after {waited:?}")]
    Timeout {
        mac: String,
        path: PathBuf,
        waited: Duration,
    },
    #[error("invalid MAC address {0}")]
    InvalidMac(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub ip_address: String,
    pub hw_address: String,
}

/// Parses `{ key=value ... }` blocks. Unknown keys are ignored.
pub fn parse_leases(content: &str) -> Vec<Lease> {
    let mut leases = Vec::new();
    let mut current: Option<Lease> = None;

    for line in content.lines().map(str::trim) {
        match line {
            "{" => current = Some(Lease::default()),
            "}" => {
                if let Some(lease) = current.take() {
                    leases.push(lease);
                }
            }
            _ => {
                let (Some(lease), Some((key, value))) = (current.as_mut(), line.split_once('='))
                else {
                    continue;
                };
                match key {
                    "name" => lease.name = value.to_string(),
                    "ip_address" => lease.ip_address = value.to_string(),
                    // hardware type prefix, e.g. `1,56:12:...`
                    "hw_address" => {
                        lease.hw_address = value
                            .split_once(',')
                            .map_or(value, |(_, mac)| mac)
                            .to_string()
                    }
                    _ => {}
                }
            }
        }
    }

    leases
}

/// Octets of a MAC address. The lease table drops leading zeros (`5e:1:2:...`).
pub fn normalize_mac(mac: &str) -> Option<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = mac.trim().split(':');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

/// The most recent lease for `mac`; later blocks in the table win.
pub fn find_lease<'a>(leases: &'a [Lease], mac: &[u8; 6]) -> Option<&'a Lease> {
    leases
        .iter()
        .rev()
        .find(|lease| normalize_mac(&lease.hw_address).as_ref() == Some(mac))
}

/// Polls the lease table until `mac` has an address, `timeout` elapses or `cancel` fires.
pub async fn wait_for_address(
    path: &Path,
    mac: &str,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<String, DhcpError> {
    let wanted = normalize_mac(mac).ok_or_else(|| DhcpError::InvalidMac(mac.to_string()))?;
    let started = Instant::now();
    info!("Waiting for a DHCP lease for {}", mac);

    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let leases = parse_leases(&content);
                if let Some(lease) = find_lease(&leases, &wanted) {
                    if !lease.ip_address.is_empty() {
                        info!("Guest {} leased {}", mac, lease.ip_address);
                        return Ok(lease.ip_address.clone());
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Lease table {} does not exist yet", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        if started.elapsed() >= timeout {
            return Err(DhcpError::Timeout {
                mac: mac.to_string(),
                path: path.to_path_buf(),
                waited: timeout,
            });
        }

        tokio::select! {
            _ = sleep(poll) => {}
            _ = cancel.cancelled() => return Err(DhcpError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LEASES: &str = "{
\tname=alpine
\tip_address=192.168.64.2
\thw_address=1,56:12:34:56:78:9a
\tidentifier=1,56:12:34:56:78:9a
\tlease=0x62d7f2c1
}
{
\tname=debian
\tip_address=192.168.64.3
\thw_address=1,5e:1:2:3:4:f
\tlease=0x62d7f2c2
}
{
\tname=alpine
\tip_address=192.168.64.9
\thw_address=1,56:12:34:56:78:9a
}
";

    #[test]
    fn test_parse_leases() {
        let leases = parse_leases(LEASES);
        assert_eq!(leases.len(), 3);
        assert_eq!(leases[1].name, "debian");
        assert_eq!(leases[1].hw_address, "5e:1:2:3:4:f");
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("5e:1:2:3:4:f"),
            normalize_mac("5e:01:02:03:04:0F")
        );
        assert!(normalize_mac("5e:1:2:3:4").is_none());
        assert!(normalize_mac("5e:1:2:3:4:5:6").is_none());
        assert!(normalize_mac("zz:1:2:3:4:5").is_none());
    }

    #[test]
    fn test_find_lease_prefers_latest() {
        let leases = parse_leases(LEASES);
        let mac = normalize_mac("56:12:34:56:78:9A").unwrap();
        assert_eq!(find_lease(&leases, &mac).unwrap().ip_address, "192.168.64.9");

        let mac = normalize_mac("5e:01:02:03:04:0f").unwrap();
        assert_eq!(find_lease(&leases, &mac).unwrap().ip_address, "192.168.64.3");
    }

    #[tokio::test]
    async fn test_wait_for_address_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dhcpd_leases");
        std::fs::write(&path, LEASES).unwrap();

        let ip = wait_for_address(
            &path,
            "5e:01:02:03:04:0f",
            Duration::from_secs(1),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ip, "192.168.64.3");
    }

    #[tokio::test]
    async fn test_wait_for_address_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing");

        let err = wait_for_address(
            &path,
            "02:00:00:00:00:01",
            Duration::from_millis(50),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DhcpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_address_cancelled() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_address(
            &dir.path().join("missing"),
            "02:00:00:00:00:01",
            Duration::from_secs(60),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DhcpError::Cancelled));
    }
}
