//! This instance's externally reachable address
//!
//! The external URL comes from one of two places:
//!
//! - a manual override persisted in the settings table, which also disables
//!   automatic mapping on later startups until it is cleared, or
//! - a UPnP port mapping on the local router.
//!
//! Changes to the effective URL are published on a `watch` channel; the
//! announce publisher listens on it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::store::Database;
use crate::token::normalize_url;

/// Settings key holding the manual external URL
pub const EXTERNAL_URL_SETTING: &str = "external_url";

const MAPPING_DESCRIPTION: &str = "mediamesh";

/// A port opened on the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Gateway's public address
    pub external_ip: IpAddr,
    /// Public port forwarded to us
    pub external_port: u16,
}

/// Opens and closes ports on the local router
#[async_trait]
pub trait PortMapper: Send + Sync + 'static {
    /// Forward `external_port` on the gateway to `local_port` on this host
    async fn map(&self, external_port: u16, local_port: u16, lease: Duration) -> Result<PortMapping>;

    /// Remove a mapping created by [`PortMapper::map`]
    async fn unmap(&self, external_port: u16) -> Result<()>;
}

/// UPnP state reported to the operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpnpStatus {
    /// Whether a mapping is in place
    pub active: bool,
    /// Gateway's public address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<IpAddr>,
    /// Forwarded port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    /// Why the last attempt failed or was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of the networking status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Our instance id
    pub instance_id: Uuid,
    /// Our display name
    pub instance_name: String,
    /// Effective external URL
    pub external_url: Option<String>,
    /// UPnP state
    pub upnp: UpnpStatus,
}

#[derive(Debug, Default)]
struct State {
    manual_url: Option<String>,
    upnp: UpnpStatus,
}

impl State {
    fn upnp_url(&self) -> Option<String> {
        match (self.upnp.active, self.upnp.external_ip, self.upnp.external_port) {
            (true, Some(ip), Some(port)) => Some(format!("http://{}", SocketAddr::new(ip, port))),
            _ => None,
        }
    }

    fn effective_url(&self) -> Option<String> {
        self.manual_url.clone().or_else(|| self.upnp_url())
    }
}

/// Manages the external address
pub struct NetworkingManager {
    db: Arc<Database>,
    identity: Arc<IdentityStore>,
    mapper: Arc<dyn PortMapper>,
    local_port: u16,
    timeout: Duration,
    lease: Duration,
    state: RwLock<State>,
    url_tx: watch::Sender<Option<String>>,
    inflight: Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>,
}

impl NetworkingManager {
    /// Create a manager. Nothing happens until [`NetworkingManager::start`].
    pub fn new(
        db: Arc<Database>,
        identity: Arc<IdentityStore>,
        mapper: Arc<dyn PortMapper>,
        local_port: u16,
        timeout: Duration,
        lease: Duration,
    ) -> Self {
        let (url_tx, _) = watch::channel(None);
        Self {
            db,
            identity,
            mapper,
            local_port,
            timeout,
            lease,
            state: RwLock::new(State::default()),
            url_tx,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Determine the external address at startup
    pub async fn start(&self) -> Result<NetworkStatus> {
        if let Some(url) = self.db.setting(EXTERNAL_URL_SETTING)? {
            info!(url = %url, "Using manually configured external URL, skipping UPnP");
            {
                let mut state = self.state.write();
                state.manual_url = Some(url);
                state.upnp = UpnpStatus {
                    error: Some("disabled while a manual external URL is set".to_string()),
                    ..UpnpStatus::default()
                };
            }
            self.publish();
            return Ok(self.status());
        }

        self.attempt(self.local_port).await;
        Ok(self.status())
    }

    /// Re-attempt the port mapping, optionally on another external port.
    ///
    /// The mapping always forwards to the port the API listens on.
    pub async fn retry_upnp(&self, port: Option<i64>) -> Result<NetworkStatus> {
        let port = match port {
            None => self.local_port,
            Some(p) => u16::try_from(p)
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| Error::validation(format!("port {p} is outside 1-65535")))?,
        };

        self.attempt(port).await;
        Ok(self.status())
    }

    /// Set or clear the manual external URL
    pub fn set_external_url(&self, url: Option<&str>) -> Result<Option<String>> {
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(normalize_url)
            .transpose()?;

        self.db.set_setting(EXTERNAL_URL_SETTING, url.as_deref())?;
        {
            let mut state = self.state.write();
            state.manual_url = url.clone();
            if url.is_none() && !state.upnp.active {
                state.upnp.error = None;
            }
        }
        match &url {
            Some(url) => info!(url = %url, "Manual external URL set"),
            None => info!("Manual external URL cleared"),
        }
        self.publish();
        Ok(self.external_url())
    }

    /// Current effective external URL
    pub fn external_url(&self) -> Option<String> {
        self.state.read().effective_url()
    }

    /// Snapshot for the status endpoint
    pub fn status(&self) -> NetworkStatus {
        let identity = self.identity.get();
        let state = self.state.read();
        NetworkStatus {
            instance_id: identity.id,
            instance_name: identity.name,
            external_url: state.effective_url(),
            upnp: state.upnp.clone(),
        }
    }

    /// Watch the effective external URL
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.url_tx.subscribe()
    }

    /// Remove the port mapping, if any. Best-effort.
    pub async fn release(&self) {
        let port = {
            let state = self.state.read();
            match (state.upnp.active, state.upnp.external_port) {
                (true, Some(port)) => port,
                _ => return,
            }
        };

        self.unmap(port).await;
        self.state.write().upnp = UpnpStatus::default();
        self.publish();
    }

    async fn unmap(&self, port: u16) {
        match tokio::time::timeout(self.timeout, self.mapper.unmap(port)).await {
            Ok(Ok(())) => info!(port, "UPnP mapping removed"),
            Ok(Err(e)) => warn!(port, error = %e, "Failed to remove UPnP mapping"),
            Err(_) => warn!(port, "Timed out removing UPnP mapping"),
        }
    }

    async fn attempt(&self, port: u16) {
        // One attempt per port at a time
        let flight = self.inflight.lock().entry(port).or_default().clone();
        let _guard = flight.lock().await;

        debug!(port, local_port = self.local_port, "Attempting UPnP port mapping");
        let mapping = self.mapper.map(port, self.local_port, self.lease);
        let outcome = match tokio::time::timeout(self.timeout, mapping).await {
            Ok(result) => result,
            Err(_) => Err(Error::unreachable(format!(
                "UPnP mapping timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        let previous = {
            let state = self.state.read();
            state.upnp.active.then_some(state.upnp.external_port).flatten()
        };

        let upnp = match outcome {
            Ok(mapping) => {
                if let Some(old) = previous.filter(|old| *old != mapping.external_port) {
                    self.unmap(old).await;
                }
                info!(
                    external_ip = %mapping.external_ip,
                    external_port = mapping.external_port,
                    "UPnP port mapping active"
                );
                UpnpStatus {
                    active: true,
                    external_ip: Some(mapping.external_ip),
                    external_port: Some(mapping.external_port),
                    error: None,
                }
            }
            Err(e) => {
                warn!(port, error = %e, "UPnP port mapping failed");
                UpnpStatus {
                    error: Some(e.to_string()),
                    ..UpnpStatus::default()
                }
            }
        };

        self.state.write().upnp = upnp;
        self.publish();
    }

    fn publish(&self) {
        let url = self.external_url();
        self.url_tx.send_if_modified(|current| {
            if *current == url {
                false
            } else {
                debug!(url = ?url, "External URL changed");
                *current = url;
                true
            }
        });
    }
}

/// [`PortMapper`] backed by an IGD (UPnP) gateway
#[derive(Debug, Clone)]
pub struct IgdPortMapper {
    search_timeout: Duration,
}

impl IgdPortMapper {
    /// Create a mapper that waits at most `search_timeout` for a gateway
    pub fn new(search_timeout: Duration) -> Self {
        Self { search_timeout }
    }

    async fn gateway(&self) -> Result<igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>> {
        search_gateway(SearchOptions {
            timeout: Some(self.search_timeout),
            ..SearchOptions::default()
        })
        .await
        .map_err(|e| Error::unreachable(format!("no UPnP gateway found: {e}")))
    }
}

#[async_trait]
impl PortMapper for IgdPortMapper {
    async fn map(&self, external_port: u16, local_port: u16, lease: Duration) -> Result<PortMapping> {
        let gateway = self.gateway().await?;
        let local_ip = local_ip_towards(gateway.addr).await?;

        let external_ip = gateway
            .get_external_ip()
            .await
            .map_err(|e| Error::unreachable(format!("gateway did not report external IP: {e}")))?;

        let lease_secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                external_port,
                SocketAddr::new(local_ip, local_port),
                lease_secs,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|e| Error::unreachable(format!("gateway refused port mapping: {e}")))?;

        Ok(PortMapping {
            external_ip,
            external_port,
        })
    }

    async fn unmap(&self, external_port: u16) -> Result<()> {
        let gateway = self.gateway().await?;
        gateway
            .remove_port(PortMappingProtocol::TCP, external_port)
            .await
            .map_err(|e| Error::unreachable(format!("gateway refused to remove mapping: {e}")))
    }
}

/// The local address the OS would use to reach `target`
async fn local_ip_towards(target: SocketAddr) -> Result<IpAddr> {
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = tokio::net::UdpSocket::bind(bind)
        .await
        .map_err(|e| Error::unreachable(format!("failed to bind probe socket: {e}")))?;
    socket
        .connect(target)
        .await
        .map_err(|e| Error::unreachable(format!("no route to gateway {target}: {e}")))?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| Error::unreachable(format!("failed to read local address: {e}")))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Mapper that succeeds or fails on demand and counts calls
    struct FakeMapper {
        succeed: bool,
        delay: Duration,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        forwards: Mutex<Vec<(u16, u16)>>,
        unmapped: Mutex<Vec<u16>>,
    }

    impl FakeMapper {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                forwards: Mutex::new(Vec::new()),
                unmapped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PortMapper for FakeMapper {
        async fn map(&self, external_port: u16, local_port: u16, _lease: Duration) -> Result<PortMapping> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.succeed {
                self.forwards.lock().push((external_port, local_port));
                Ok(PortMapping {
                    external_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
                    external_port,
                })
            } else {
                Err(Error::unreachable("no UPnP gateway found"))
            }
        }

        async fn unmap(&self, external_port: u16) -> Result<()> {
            self.unmapped.lock().push(external_port);
            Ok(())
        }
    }

    fn manager(mapper: Arc<FakeMapper>) -> (NetworkingManager, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(IdentityStore::load_or_create(db.clone(), "Local").unwrap());
        let manager = NetworkingManager::new(
            db.clone(),
            identity,
            mapper,
            3000,
            Duration::from_secs(2),
            Duration::from_secs(3600),
        );
        (manager, db)
    }

    #[tokio::test]
    async fn test_start_with_successful_mapping() {
        let mapper = Arc::new(FakeMapper::new(true));
        let (manager, _db) = manager(mapper.clone());
        let mut rx = manager.subscribe();

        let status = manager.start().await.unwrap();
        assert!(status.upnp.active);
        assert_eq!(status.upnp.external_port, Some(3000));
        assert_eq!(status.external_url.as_deref(), Some("http://203.0.113.7:3000"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_deref(), Some("http://203.0.113.7:3000"));
    }

    #[tokio::test]
    async fn test_start_with_failed_mapping() {
        let (manager, _db) = manager(Arc::new(FakeMapper::new(false)));
        let status = manager.start().await.unwrap();
        assert!(!status.upnp.active);
        assert!(status.upnp.error.unwrap().contains("no UPnP gateway"));
        assert_eq!(status.external_url, None);
    }

    #[tokio::test]
    async fn test_mapping_timeout_reported_as_failure() {
        let mut slow = FakeMapper::new(true);
        slow.delay = Duration::from_secs(5);
        let (manager, _db) = manager(Arc::new(slow));

        let status = manager.start().await.unwrap();
        assert!(!status.upnp.active);
        assert!(status.upnp.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retry_rejects_invalid_port_before_mapping() {
        let mapper = Arc::new(FakeMapper::new(true));
        let (manager, _db) = manager(mapper.clone());

        for port in [0, -1, 65536, 100_000] {
            let result = manager.retry_upnp(Some(port)).await;
            assert!(matches!(result, Err(Error::Validation(_))), "port {port}");
        }
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 0);

        let status = manager.retry_upnp(Some(65535)).await.unwrap();
        assert_eq!(status.upnp.external_port, Some(65535));
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_on_new_port_replaces_previous_mapping() {
        let mapper = Arc::new(FakeMapper::new(true));
        let (manager, _db) = manager(mapper.clone());

        manager.start().await.unwrap();
        manager.retry_upnp(Some(3000)).await.unwrap();
        assert!(mapper.unmapped.lock().is_empty());

        let status = manager.retry_upnp(Some(8443)).await.unwrap();
        assert_eq!(status.external_url.as_deref(), Some("http://203.0.113.7:8443"));
        assert_eq!(*mapper.unmapped.lock(), vec![3000]);
        assert_eq!(
            *mapper.forwards.lock(),
            vec![(3000, 3000), (3000, 3000), (8443, 3000)]
        );

        manager.release().await;
        assert_eq!(*mapper.unmapped.lock(), vec![3000, 8443]);
    }

    #[tokio::test]
    async fn test_concurrent_retries_for_same_port_are_serialized() {
        let mut mapper = FakeMapper::new(true);
        mapper.delay = Duration::from_millis(50);
        let mapper = Arc::new(mapper);
        let (manager, _db) = manager(mapper.clone());
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.retry_upnp(Some(4000)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(mapper.calls.load(Ordering::SeqCst), 4);
        assert_eq!(mapper.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_url_skips_mapping_on_next_start() {
        let mapper = Arc::new(FakeMapper::new(true));
        let (manager, db) = manager(mapper.clone());

        manager.set_external_url(Some("https://media.example.net/")).unwrap();
        assert_eq!(
            manager.external_url().as_deref(),
            Some("https://media.example.net")
        );

        // A fresh manager over the same database sees the override
        let identity = Arc::new(IdentityStore::load_or_create(db.clone(), "Local").unwrap());
        let restarted = NetworkingManager::new(
            db,
            identity,
            mapper.clone(),
            3000,
            Duration::from_secs(2),
            Duration::from_secs(3600),
        );
        let status = restarted.start().await.unwrap();
        assert_eq!(status.external_url.as_deref(), Some("https://media.example.net"));
        assert!(!status.upnp.active);
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 0);

        // Clearing falls back to nothing until a mapping succeeds
        assert_eq!(restarted.set_external_url(None).unwrap(), None);
        let status = restarted.retry_upnp(None).await.unwrap();
        assert_eq!(status.external_url.as_deref(), Some("http://203.0.113.7:3000"));
    }

    #[tokio::test]
    async fn test_set_external_url_validates() {
        let (manager, _db) = manager(Arc::new(FakeMapper::new(true)));
        assert!(matches!(
            manager.set_external_url(Some("not a url")),
            Err(Error::Validation(_))
        ));
        assert_eq!(manager.external_url(), None);
    }
}
