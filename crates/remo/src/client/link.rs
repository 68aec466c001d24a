//! # Remote Access Point
//!
//! One client connection to a server access point.
//!
//! Lifecycle: `connect` opens the socket, then RequestAccess goes out on a
//! later task turn. A one-shot watchdog reports failure unless the server
//! answers the handshake within `connect_timeout`. Once granted, every proxy
//! owned by the link is activated.
//!
//! ## Invariants
//! - Each connection attempt carries a generation number. Callbacks from a
//!   superseded attempt are ignored.
//! - A disconnect fails every in-flight request with `Disconnected` and
//!   deactivates every proxy. Proxies themselves survive and are activated
//!   again on the next grant.
//! - A handshake that ends without a grant (denial, close, timeout) reports
//!   could-not-activate on every proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use remowire::Body;
use remowire::FrameBuffer;
use remowire::Message;
use remowire::Role;

use crate::client::proxy::ProxyInner;
use crate::client::proxy::RemoteObject;
use crate::config::ClientConfig;
use crate::error::LinkError;
use crate::error::ProxyError;
use crate::outbox::Outbox;

const READ_CHUNK: usize = 16 * 1024;
const EVENT_CAPACITY: usize = 64;

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    AccessGranted,
    AccessDenied,
    /// The socket could not be opened, or the handshake timed out.
    ConnectFailed(String),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

struct LinkState {
    phase: Phase,
    granted: bool,
    outbox: Option<Outbox>,
    task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    generation: u64,
}

/// What a matched reply is delivered to.
enum Pending {
    /// A RequestObject sent on behalf of a proxy. Weak so that a proxy dropped
    /// meanwhile can be detected and its orphaned id released.
    Activation(Weak<ProxyInner>),
    Reply(oneshot::Sender<Result<Message, ProxyError>>),
}

pub(crate) struct LinkInner {
    addr: SocketAddr,
    config: ClientConfig,
    state: Mutex<LinkState>,
    in_flight: DashMap<i32, Pending>,
    pub(crate) proxies: DashMap<String, RemoteObject>,
    next_id: AtomicI32,
    events: broadcast::Sender<LinkEvent>,
}

/// Client handle to one server. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RemoteAccessPoint {
    inner: Arc<LinkInner>,
}

impl RemoteAccessPoint {
    /// Creates a disconnected access point. Call `connect` to open it.
    pub fn new(addr: SocketAddr, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = LinkState {
            phase: Phase::Disconnected,
            granted: false,
            outbox: None,
            task: None,
            watchdog: None,
            generation: 0,
        };
        let inner = LinkInner {
            addr,
            config,
            state: Mutex::new(state),
            in_flight: DashMap::new(),
            proxies: DashMap::new(),
            next_id: AtomicI32::new(1),
            events,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Opens the connection unless one is open or opening. Must be called
    /// within a tokio runtime.
    pub fn connect(&self) {
        let mut state = self.inner.lock_state();
        if state.phase != Phase::Disconnected {
            return;
        }
        state.phase = Phase::Connecting;
        state.granted = false;
        state.generation += 1;
        let generation = state.generation;

        let timeout = self.inner.config.connect_timeout;
        state.watchdog = Some(tokio::spawn(watchdog(Arc::downgrade(&self.inner), generation, timeout)));
        state.task = Some(tokio::spawn(run(self.inner.clone(), generation)));
        debug!(peer = %self.inner.addr, generation, "connecting");
    }

    /// Sends ReleaseAccess and closes the connection.
    pub fn disconnect(&self) {
        let (generation, task) = {
            let mut state = self.inner.lock_state();
            if state.phase == Phase::Disconnected {
                return;
            }
            if let Some(outbox) = state.outbox.as_ref() {
                let msg = Message::new(self.inner.next_id(), Body::ReleaseAccess);
                if let Err(e) = outbox.send(&msg) {
                    debug!(peer = %self.inner.addr, error = %e, "release access not sent");
                }
            }
            (state.generation, state.task.take())
        };
        self.inner.on_disconnected(generation);
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Connected and granted access.
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().phase == Phase::Connected
    }

    /// Returns the proxy for `name`, creating it and attempting activation if
    /// this access point has none yet.
    pub fn get_object(&self, name: &str) -> RemoteObject {
        if let Some(proxy) = self.inner.proxies.get(name) {
            return proxy.value().clone();
        }
        let proxy = self
            .inner
            .proxies
            .entry(name.to_string())
            .or_insert_with(|| RemoteObject::new(name, Arc::downgrade(&self.inner)))
            .value()
            .clone();
        self.inner.activate(&proxy);
        proxy
    }

    /// Proxies owned by this access point.
    pub fn objects(&self) -> Vec<RemoteObject> {
        self.inner.proxy_snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for RemoteAccessPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAccessPoint")
            .field("addr", &self.inner.addr)
            .field("valid", &self.inner.is_valid())
            .field("objects", &self.inner.proxies.len())
            .finish()
    }
}

impl LinkInner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_valid(&self) -> bool {
        let state = self.lock_state();
        state.phase == Phase::Connected && state.granted
    }

    fn outbox(&self) -> Option<Outbox> {
        self.lock_state().outbox.clone()
    }

    fn notify(&self, event: LinkEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn proxy_snapshot(&self) -> Vec<RemoteObject> {
        self.proxies.iter().map(|e| e.value().clone()).collect()
    }

    /// Sends a request and waits for the reply carrying the same id.
    pub(crate) async fn request(&self, body: Body) -> Result<Message, ProxyError> {
        let outbox = self.outbox().ok_or(ProxyError::Disconnected)?;
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(id, Pending::Reply(tx));

        if let Err(e) = outbox.send(&Message::new(id, body)) {
            self.in_flight.remove(&id);
            return Err(e.into());
        }
        rx.await.unwrap_or(Err(ProxyError::Disconnected))
    }

    /// Sends a message nobody waits on.
    pub(crate) fn post(&self, body: Body) -> Result<(), LinkError> {
        let outbox = self.outbox().ok_or(LinkError::NotConnected)?;
        outbox.send(&Message::new(self.next_id(), body))
    }

    /// Asks the server for the proxy's object. A no-op unless valid.
    pub(crate) fn activate(&self, proxy: &RemoteObject) {
        if !self.is_valid() || proxy.is_active() || proxy.is_released() {
            return;
        }
        let Some(outbox) = self.outbox() else {
            return;
        };
        proxy.inner.begin_activation();

        let id = self.next_id();
        self.in_flight.insert(id, Pending::Activation(Arc::downgrade(&proxy.inner)));
        let msg = Message::new(id, Body::RequestObject { name: proxy.name().to_string() });
        if let Err(e) = outbox.send(&msg) {
            debug!(peer = %self.addr, object = %proxy.name(), error = %e, "activation not sent");
            self.in_flight.remove(&id);
            proxy.inner.could_not_activate();
        }
    }

    fn request_access(&self, generation: u64) {
        let outbox = {
            let state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state.outbox.clone()
        };
        let Some(outbox) = outbox else {
            return;
        };
        let msg = Message::new(self.next_id(), Body::RequestAccess { app_name: self.config.identity.clone() });
        if let Err(e) = outbox.send(&msg) {
            warn!(peer = %self.addr, error = %e, "access request not sent");
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Message, generation: u64) {
        let Message { id, body, context } = msg;
        match body {
            Body::RequestAccessRes { granted } => self.on_access_reply(generation, granted),
            Body::RequestObjectRes { object_id } => self.on_object_reply(id, object_id),
            Body::ReleaseObject { object_id } => {
                if let Some(proxy) = self.proxy_by_id(object_id) {
                    debug!(peer = %self.addr, object = %proxy.name(), "released by server");
                    proxy.inner.deactivate();
                }
            }
            Body::EventDelivery { object_id, event, args } => match self.proxy_by_id(object_id) {
                Some(proxy) => proxy.inner.deliver(&event, args),
                None => debug!(peer = %self.addr, id = object_id, %event, "event for unknown object"),
            },
            body => match self.in_flight.remove(&id) {
                Some((_, Pending::Reply(tx))) => {
                    let _ = tx.send(Ok(Message { id, body, context }));
                }
                Some((_, Pending::Activation(_))) => {
                    warn!(peer = %self.addr, id, kind = %body.message_type(), "unexpected reply to object request");
                }
                None => debug!(peer = %self.addr, id, kind = %body.message_type(), "unmatched reply"),
            },
        }
    }

    fn on_access_reply(self: &Arc<Self>, generation: u64, granted: bool) {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
            state.granted = granted;
        }

        let link = self.clone();
        if granted {
            info!(peer = %self.addr, "access granted");
            self.notify(LinkEvent::AccessGranted);
            tokio::spawn(async move {
                for proxy in link.proxy_snapshot() {
                    link.activate(&proxy);
                }
            });
        } else {
            warn!(peer = %self.addr, identity = %self.config.identity, "access denied");
            self.notify(LinkEvent::AccessDenied);
            for proxy in self.proxy_snapshot() {
                proxy.inner.could_not_activate();
            }
            // The server closes its end once our write half shuts down.
            tokio::spawn(async move {
                if let Some(outbox) = link.outbox() {
                    outbox.close();
                }
            });
        }
    }

    fn on_object_reply(&self, id: i32, object_id: i32) {
        let proxy = match self.in_flight.remove(&id) {
            Some((_, Pending::Activation(proxy))) => proxy.upgrade(),
            Some((_, Pending::Reply(tx))) => {
                let _ = tx.send(Ok(Message::new(id, Body::RequestObjectRes { object_id })));
                return;
            }
            None => {
                debug!(peer = %self.addr, id, "unmatched object reply");
                return;
            }
        };

        match proxy {
            Some(proxy) if !proxy.is_released() => {
                if object_id >= 0 {
                    proxy.activate(object_id);
                } else {
                    proxy.could_not_activate();
                }
            }
            _ if object_id >= 0 => {
                debug!(peer = %self.addr, id = object_id, "proxy gone, releasing orphaned id");
                if let Err(e) = self.post(Body::ReleaseObject { object_id }) {
                    debug!(peer = %self.addr, error = %e, "orphan release not sent");
                }
            }
            _ => {}
        }
    }

    fn proxy_by_id(&self, object_id: i32) -> Option<RemoteObject> {
        self.proxies
            .iter()
            .find(|e| e.value().id() == Some(object_id))
            .map(|e| e.value().clone())
    }

    fn on_connect_failed(&self, generation: u64, reason: String) {
        {
            let mut state = self.lock_state();
            if state.generation != generation || state.phase == Phase::Disconnected {
                return;
            }
            state.phase = Phase::Disconnected;
            state.task = None;
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
        }
        warn!(peer = %self.addr, %reason, "connect failed");
        self.notify(LinkEvent::ConnectFailed(reason));
        for proxy in self.proxy_snapshot() {
            proxy.inner.could_not_activate();
        }
    }

    fn on_disconnected(&self, generation: u64) {
        let (outbox, was_granted) = {
            let mut state = self.lock_state();
            if state.generation != generation || state.phase == Phase::Disconnected {
                return;
            }
            state.phase = Phase::Disconnected;
            let was_granted = std::mem::replace(&mut state.granted, false);
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
            (state.outbox.take(), was_granted)
        };
        if let Some(outbox) = outbox {
            outbox.close();
        }

        let ids: Vec<i32> = self.in_flight.iter().map(|e| *e.key()).collect();
        for id in ids {
            match self.in_flight.remove(&id) {
                Some((_, Pending::Reply(tx))) => {
                    let _ = tx.send(Err(ProxyError::Disconnected));
                }
                Some((_, Pending::Activation(proxy))) => {
                    if let Some(proxy) = proxy.upgrade() {
                        proxy.could_not_activate();
                    }
                }
                None => {}
            }
        }
        for proxy in self.proxy_snapshot() {
            proxy.inner.deactivate();
            // The handshake never completed, so no activation can follow.
            if !was_granted {
                proxy.inner.could_not_activate();
            }
        }

        info!(peer = %self.addr, "disconnected");
        self.notify(LinkEvent::Disconnected);
    }
}

async fn run(link: Arc<LinkInner>, generation: u64) {
    let stream = match TcpStream::connect(link.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            link.on_connect_failed(generation, e.to_string());
            return;
        }
    };
    let (reader, writer) = stream.into_split();
    let outbox = Outbox::spawn(
        Role::Client,
        link.addr.to_string(),
        link.config.retry_delay,
        link.config.transcript.clone(),
        writer,
    );

    {
        let mut state = link.lock_state();
        if state.generation != generation || state.phase != Phase::Connecting {
            outbox.close();
            return;
        }
        state.phase = Phase::Connected;
        state.outbox = Some(outbox.clone());
    }
    info!(peer = %link.addr, "connected");
    link.notify(LinkEvent::Connected);

    let handshake = link.clone();
    tokio::spawn(async move { handshake.request_access(generation) });

    read_loop(&link, reader, &outbox, generation).await;
    link.on_disconnected(generation);
}

async fn read_loop(link: &Arc<LinkInner>, mut reader: OwnedReadHalf, outbox: &Outbox, generation: u64) {
    let mut frames = FrameBuffer::new(link.config.limits);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!(peer = %link.addr, "server closed the connection");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %link.addr, error = %e, "read failed");
                return;
            }
        };
        if let Err(e) = frames.extend(&chunk[..n]) {
            warn!(peer = %link.addr, error = %e, "resetting corrupt stream");
            return;
        }
        loop {
            match frames.next_message() {
                Ok(Some(msg)) => {
                    outbox.note_received(&msg);
                    link.dispatch(msg, generation);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %link.addr, error = %e, "resetting corrupt stream");
                    return;
                }
            }
        }
    }
}

async fn watchdog(link: Weak<LinkInner>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(link) = link.upgrade() else {
        return;
    };
    if link.lock_state().generation != generation {
        return;
    }
    warn!(peer = %link.addr, ?timeout, "no access reply before timeout");
    link.notify(LinkEvent::ConnectFailed("timed out waiting for access".to_string()));
    for proxy in link.proxy_snapshot() {
        proxy.inner.could_not_activate();
    }
}
