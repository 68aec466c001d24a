//! # Client
//!
//! The connecting side. A [`ConnectionManager`] hands out one
//! [`RemoteAccessPoint`] per server address; each access point owns the
//! [`RemoteObject`] proxies created through it.

mod link;
mod proxy;

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::ClientConfig;

pub use link::LinkEvent;
pub use link::RemoteAccessPoint;
pub use proxy::EventStream;
pub use proxy::ProxyEvent;
pub use proxy::RemoteObject;

struct ManagerInner {
    config: ClientConfig,
    links: DashMap<SocketAddr, RemoteAccessPoint>,
}

/// Registry of remote access points keyed by address. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let inner = ManagerInner { config, links: DashMap::new() };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the access point for `address:port`, creating and connecting
    /// it on first use. Must be called within a tokio runtime.
    pub fn get(&self, address: IpAddr, port: u16) -> RemoteAccessPoint {
        let addr = SocketAddr::new(address, port);
        let entry = self.inner.links.entry(addr).or_insert_with(|| {
            debug!(peer = %addr, "new remote access point");
            let link = RemoteAccessPoint::new(addr, self.inner.config.clone());
            link.connect();
            link
        });
        entry.value().clone()
    }

    /// Every access point created so far, ordered by address.
    pub fn list(&self) -> Vec<RemoteAccessPoint> {
        let mut links: Vec<RemoteAccessPoint> = self.inner.links.iter().map(|e| e.value().clone()).collect();
        links.sort_by_key(RemoteAccessPoint::addr);
        links
    }

    /// Disconnects and forgets every access point.
    pub fn close_all(&self) {
        let links: Vec<RemoteAccessPoint> = self.inner.links.iter().map(|e| e.value().clone()).collect();
        self.inner.links.clear();
        for link in links {
            link.disconnect();
        }
    }
}
