use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::identity::Role;
use crate::protocol::DiscoverResponse;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// A controller that answered the discovery probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredController {
    pub address: Ipv4Addr,
    /// Transport port advertised by the controller itself.
    pub port: u16,
    pub device_id: String,
    pub device_name: String,
    pub version: String,
}

/// The host's LAN-facing IPv4 address. Falls back to the UDP-connect trick
/// when the platform lookup yields nothing usable.
pub fn local_ipv4() -> Result<Ipv4Addr> {
    if let Ok(IpAddr::V4(v4)) = local_ip_address::local_ip() {
        if !v4.is_loopback() {
            return Ok(v4);
        }
    }

    let socket = UdpSocket::bind("0.0.0.0:0").context("no usable network interface")?;
    socket
        .connect("8.8.8.8:80")
        .context("cannot determine local address")?;
    match socket
        .local_addr()
        .context("cannot determine local address")?
        .ip()
    {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => anyhow::bail!("no IPv4 address on the active interface"),
    }
}

/// Finds controllers on the local /24 by probing every host address
/// concurrently. Read-only; individual host failures are absorbed.
pub struct DiscoveryService {
    http: reqwest::Client,
    probe_timeout: Duration,
    scanning: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl DiscoveryService {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            probe_timeout,
            scanning: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    /// Probe the /24 derived from the local address. Fails fast when the
    /// local address cannot be determined; starting a second scan while one
    /// runs is a no-op that returns an empty list.
    pub async fn scan(&self, probe_port: u16) -> Result<Vec<DiscoveredController>> {
        let local = local_ipv4().context("discovery scan aborted")?;
        let [a, b, c, _] = local.octets();
        self.scan_subnet(Ipv4Addr::new(a, b, c, 0), probe_port).await
    }

    /// Probe `base.1..=base.254` on `probe_port`. All probes are in flight
    /// simultaneously, each bounded by its own timeout.
    pub async fn scan_subnet(
        &self,
        base: Ipv4Addr,
        probe_port: u16,
    ) -> Result<Vec<DiscoveredController>> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            tracing::debug!("discovery scan already running, ignoring");
            return Ok(Vec::new());
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let [a, b, c, _] = base.octets();
        let mut probes = JoinSet::new();
        for host in 1..=254u8 {
            let ip = Ipv4Addr::new(a, b, c, host);
            let client = self.http.clone();
            let timeout = self.probe_timeout;
            let token = token.clone();
            probes.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => None,
                    hit = probe(client, ip, probe_port, timeout) => hit,
                }
            });
        }

        let mut found = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(Some(controller)) = joined {
                tracing::info!(
                    "discovered controller {} at {}",
                    controller.device_name,
                    controller.address
                );
                found.push(controller);
            }
        }

        *self.cancel.lock() = None;
        self.scanning.store(false, Ordering::SeqCst);
        Ok(found)
    }

    /// Abort all in-flight probes. The running scan returns promptly with
    /// whatever it had collected.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

async fn probe(
    client: reqwest::Client,
    ip: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> Option<DiscoveredController> {
    let url = format!("http://{ip}:{port}/api/discover");
    let response = client
        .get(&url)
        .header("Accept", "application/json")
        .timeout(timeout)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body: DiscoverResponse = response.json().await.ok()?;
    if body.role != Role::Controller {
        return None;
    }
    Some(DiscoveredController {
        address: ip,
        port: body.port,
        device_id: body.device_id,
        device_name: body.device_name,
        version: body.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    // 203.0.113.0/24 is TEST-NET-3: nothing routable lives there, so every
    // probe runs into its own timeout.
    #[tokio::test]
    async fn scan_of_dead_subnet_is_bounded_by_one_probe_timeout() {
        let service = DiscoveryService::new(Duration::from_millis(250));
        let started = Instant::now();
        let found = service
            .scan_subnet(Ipv4Addr::new(203, 0, 113, 0), 8901)
            .await
            .unwrap();
        assert!(found.is_empty());
        // a serialized sweep would take 254 * 250ms; concurrent probes finish
        // within a few timeouts even on a loaded runner
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn second_scan_while_running_is_a_noop() {
        let service = std::sync::Arc::new(DiscoveryService::new(Duration::from_millis(400)));

        let background = {
            let service = std::sync::Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .scan_subnet(Ipv4Addr::new(203, 0, 113, 0), 8901)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.is_scanning());

        let overlapping = service
            .scan_subnet(Ipv4Addr::new(203, 0, 113, 0), 8901)
            .await
            .unwrap();
        assert!(overlapping.is_empty());

        background.await.unwrap().unwrap();
        assert!(!service.is_scanning());
    }

    #[tokio::test]
    async fn cancel_clears_the_running_flag() {
        let service = std::sync::Arc::new(DiscoveryService::new(Duration::from_secs(5)));
        let background = {
            let service = std::sync::Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .scan_subnet(Ipv4Addr::new(203, 0, 113, 0), 8901)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        service.cancel();
        background.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!service.is_scanning());
    }
}
