//! # Remote Object Proxy
//!
//! A client-side stand-in for one named object on the server. The proxy holds
//! the transient id while active; every operation is a request/reply round
//! trip on the owning link.
//!
//! ## Invariants
//! - Operations on an inactive proxy fail with `NotActive` without touching
//!   the network.
//! - One RequestConnection per event no matter how many local subscribers;
//!   the last `unsubscribe` sends ReleaseConnection.
//! - Deactivation drops every local subscription. Open [`EventStream`]s end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use remowire::Body;
use remowire::Message;
use remowire::MessageType;
use remowire::Value;

use crate::client::link::LinkInner;
use crate::error::ProxyError;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Inactive,
    Active(i32),
    Failed,
}

/// Changes in a proxy's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Activated(i32),
    Deactivated,
    CouldNotActivate,
    /// `cache_properties` finished.
    PropertiesCached,
}

struct Relay {
    subscribers: usize,
    tx: broadcast::Sender<Vec<Value>>,
}

pub(crate) struct ProxyInner {
    name: String,
    link: Weak<LinkInner>,
    state: watch::Sender<Activation>,
    notifications: broadcast::Sender<ProxyEvent>,
    cache: DashMap<String, Value>,
    relays: Mutex<HashMap<String, Relay>>,
    released: AtomicBool,
}

impl ProxyInner {
    fn lock_relays(&self) -> MutexGuard<'_, HashMap<String, Relay>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: ProxyEvent) {
        let _ = self.notifications.send(event);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Clears a previous failure so waiters block on the new attempt.
    pub(crate) fn begin_activation(&self) {
        self.state.send_if_modified(|state| {
            if *state == Activation::Failed {
                *state = Activation::Inactive;
                return true;
            }
            false
        });
    }

    pub(crate) fn activate(&self, object_id: i32) {
        let previous = self.state.send_replace(Activation::Active(object_id));
        if previous != Activation::Active(object_id) {
            debug!(object = %self.name, id = object_id, "proxy activated");
            self.notify(ProxyEvent::Activated(object_id));
        }
    }

    pub(crate) fn could_not_activate(&self) {
        let changed = self.state.send_if_modified(|state| match state {
            Activation::Active(_) | Activation::Failed => false,
            Activation::Inactive => {
                *state = Activation::Failed;
                true
            }
        });
        if changed {
            debug!(object = %self.name, "proxy could not activate");
            self.notify(ProxyEvent::CouldNotActivate);
        }
    }

    pub(crate) fn deactivate(&self) {
        let was_active = self.state.send_if_modified(|state| match state {
            Activation::Active(_) => {
                *state = Activation::Inactive;
                true
            }
            _ => false,
        });
        self.lock_relays().clear();
        if was_active {
            debug!(object = %self.name, "proxy deactivated");
            self.notify(ProxyEvent::Deactivated);
        }
    }

    pub(crate) fn deliver(&self, event: &str, args: Vec<Value>) {
        let relays = self.lock_relays();
        match relays.get(event) {
            Some(relay) => {
                let _ = relay.tx.send(args);
            }
            None => debug!(object = %self.name, %event, "event without local subscribers"),
        }
    }

    fn object_id(&self) -> Result<i32, ProxyError> {
        if self.is_released() {
            return Err(ProxyError::Released);
        }
        match *self.state.borrow() {
            Activation::Active(id) => Ok(id),
            _ => Err(ProxyError::NotActive),
        }
    }

    async fn request(&self, body: Body) -> Result<Message, ProxyError> {
        let link = self.link.upgrade().ok_or(ProxyError::Disconnected)?;
        link.request(body).await
    }
}

/// Handle to a remote object. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RemoteObject {
    pub(crate) inner: Arc<ProxyInner>,
}

impl RemoteObject {
    pub(crate) fn new(name: &str, link: Weak<LinkInner>) -> Self {
        let (notifications, _) = broadcast::channel(CHANNEL_CAPACITY);
        let inner = ProxyInner {
            name: name.to_string(),
            link,
            state: watch::Sender::new(Activation::Inactive),
            notifications,
            cache: DashMap::new(),
            relays: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    /// The full `component.object` name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The transient id while active.
    pub fn id(&self) -> Option<i32> {
        match *self.inner.state.borrow() {
            Activation::Active(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.id().is_some()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    /// Asks the server for the object again. A no-op unless the link is valid
    /// and the proxy inactive.
    pub fn activate(&self) {
        if let Some(link) = self.inner.link.upgrade() {
            link.activate(self);
        }
    }

    /// Resolves with the id once active, or fails if activation failed.
    pub async fn activated(&self) -> Result<i32, ProxyError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| *state != Activation::Inactive)
            .await
            .map(|state| *state)
            .map_err(|_| ProxyError::Released)?;
        match state {
            Activation::Active(id) => Ok(id),
            _ => Err(ProxyError::CouldNotActivate),
        }
    }

    /// Resolves once the proxy is no longer active.
    pub async fn deactivated(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| !matches!(state, Activation::Active(_))).await;
    }

    pub fn notifications(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.notifications.subscribe()
    }

    pub async fn get_property(&self, name: &str) -> Result<Value, ProxyError> {
        let object_id = self.inner.object_id()?;
        let reply = self.inner.request(Body::GetProperty { object_id, name: name.to_string() }).await?;
        match reply.body {
            Body::GetPropertyRes { value, success: true, .. } => {
                self.inner.cache.insert(name.to_string(), value.clone());
                Ok(value)
            }
            body @ Body::GetPropertyRes { .. } => Err(ProxyError::Refused(body.message_type())),
            body => Err(ProxyError::UnexpectedReply(body.message_type())),
        }
    }

    /// Writes a property. On rejection the server echoes the value it kept,
    /// which replaces the cached one.
    pub async fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<Value, ProxyError> {
        let object_id = self.inner.object_id()?;
        let body = Body::SetProperty { object_id, name: name.to_string(), value: value.into() };
        let reply = self.inner.request(body).await?;
        match reply.body {
            Body::SetPropertyRes { value, success, .. } => {
                self.inner.cache.insert(name.to_string(), value.clone());
                if success {
                    Ok(value)
                } else {
                    Err(ProxyError::Refused(MessageType::SetPropertyRes))
                }
            }
            body => Err(ProxyError::UnexpectedReply(body.message_type())),
        }
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ProxyError> {
        let object_id = self.inner.object_id()?;
        let reply = self.inner.request(Body::InvokeMethod { object_id, method: method.to_string(), args }).await?;
        match reply.body {
            Body::InvokeMethodRes { value, success: true, .. } => Ok(value),
            body @ Body::InvokeMethodRes { .. } => Err(ProxyError::Refused(body.message_type())),
            body => Err(ProxyError::UnexpectedReply(body.message_type())),
        }
    }

    /// Names of the object's properties. Empty when the server refuses.
    pub async fn property_names(&self) -> Result<Vec<String>, ProxyError> {
        let object_id = self.inner.object_id()?;
        let reply = self.inner.request(Body::GetPropertyNames { object_id }).await?;
        match reply.body {
            Body::GetPropertyNamesRes { names, .. } => Ok(names),
            body => Err(ProxyError::UnexpectedReply(body.message_type())),
        }
    }

    /// Last value seen for a property through `get_property`, `set_property`
    /// or `cache_properties`.
    pub fn cached_property(&self, name: &str) -> Option<Value> {
        self.inner.cache.get(name).map(|v| v.value().clone())
    }

    /// Fetches every property into the cache. Properties the server refuses
    /// to read are skipped.
    pub async fn cache_properties(&self) -> Result<(), ProxyError> {
        for name in self.property_names().await? {
            match self.get_property(&name).await {
                Ok(_) | Err(ProxyError::Refused(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.inner.notify(ProxyEvent::PropertiesCached);
        Ok(())
    }

    /// Subscribes to a remote event. The stream ends when the proxy is
    /// deactivated; call `unsubscribe` once per successful `subscribe`.
    pub async fn subscribe(&self, event: &str) -> Result<EventStream, ProxyError> {
        let object_id = self.inner.object_id()?;
        let shared = self.inner.lock_relays().get_mut(event).map(|relay| {
            relay.subscribers += 1;
            relay.tx.subscribe()
        });
        if let Some(rx) = shared {
            return Ok(EventStream { event: event.to_string(), rx });
        }

        let reply = self.inner.request(Body::RequestConnection { object_id, event: event.to_string() }).await?;
        match reply.body {
            Body::RequestConnectionRes { success: true, .. } => {}
            body @ Body::RequestConnectionRes { .. } => return Err(ProxyError::Refused(body.message_type())),
            body => return Err(ProxyError::UnexpectedReply(body.message_type())),
        }

        let mut relays = self.inner.lock_relays();
        let relay = relays.entry(event.to_string()).or_insert_with(|| Relay {
            subscribers: 0,
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        });
        relay.subscribers += 1;
        Ok(EventStream { event: event.to_string(), rx: relay.tx.subscribe() })
    }

    /// Drops one local subscription. The last one releases the remote
    /// connection.
    pub async fn unsubscribe(&self, event: &str) -> Result<(), ProxyError> {
        let last = {
            let mut relays = self.inner.lock_relays();
            let Some(relay) = relays.get_mut(event) else {
                return Ok(());
            };
            relay.subscribers = relay.subscribers.saturating_sub(1);
            let last = relay.subscribers == 0;
            if last {
                relays.remove(event);
            }
            last
        };
        if !last {
            return Ok(());
        }

        let object_id = self.inner.object_id()?;
        let reply = self.inner.request(Body::ReleaseConnection { object_id, event: event.to_string() }).await?;
        match reply.body {
            Body::ReleaseConnectionRes { success: true, .. } => Ok(()),
            body @ Body::ReleaseConnectionRes { .. } => Err(ProxyError::Refused(body.message_type())),
            body => Err(ProxyError::UnexpectedReply(body.message_type())),
        }
    }

    /// Removes the proxy from its access point and tells the server to
    /// release the id.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = self.inner.state.send_replace(Activation::Inactive);
        self.inner.lock_relays().clear();

        if let Some(link) = self.inner.link.upgrade() {
            link.proxies.remove_if(&self.inner.name, |_, proxy| Arc::ptr_eq(&proxy.inner, &self.inner));
            if let Activation::Active(object_id) = previous {
                if let Err(e) = link.post(Body::ReleaseObject { object_id }) {
                    debug!(object = %self.inner.name, error = %e, "release not sent");
                }
            }
        }
        if let Activation::Active(_) = previous {
            self.inner.notify(ProxyEvent::Deactivated);
        }
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Emissions of one subscribed event.
pub struct EventStream {
    event: String,
    rx: broadcast::Receiver<Vec<Value>>,
}

impl EventStream {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The next emission's arguments, `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        loop {
            match self.rx.recv().await {
                Ok(args) => return Some(args),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = %self.event, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
