//! # Access Point
//!
//! The server side: a registry of exposed objects and a TCP listener that
//! spawns one session per accepted connection.
//!
//! ## Invariants
//! - One registration per object identity, and a full name (`component.name`)
//!   maps to at most one live object.
//! - The registry holds weak references only. An object that dies without
//!   notice simply stops resolving; `object_destroyed` additionally tells
//!   every session to drop its ids and forwarders for it.

mod forwarder;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::access::Permissions;
use crate::caller::SessionId;
use crate::config::ServerConfig;
use crate::error::RegistryError;
use crate::error::ResolveError;
use crate::object::Component;
use crate::object::ExposedObject;
use crate::object::ObjectKey;

use session::Session;

pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Registration {
    component: Arc<dyn Component>,
    name: String,
    full_name: String,
    object: Weak<dyn ExposedObject>,
    permissions: Permissions,
}

/// A live exposed object found by name.
#[derive(Clone)]
pub struct Resolved {
    pub key: ObjectKey,
    pub object: Arc<dyn ExposedObject>,
    pub component: Arc<dyn Component>,
    /// Name within the component.
    pub name: String,
    pub full_name: String,
    pub permissions: Permissions,
}

/// A snapshot of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub access_granted: bool,
    /// Transient ids currently handed out.
    pub objects: usize,
}

struct Listener {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub(crate) struct Inner {
    config: ServerConfig,
    components: DashMap<String, Arc<dyn Component>>,
    registrations: DashMap<ObjectKey, Registration>,
    names: DashMap<String, ObjectKey>,
    sessions: DashMap<SessionId, Session>,
    next_session: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

/// Server-side entry point. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AccessPoint {
    inner: Arc<Inner>,
}

impl AccessPoint {
    pub fn new(config: ServerConfig) -> Self {
        let inner = Inner {
            config,
            components: DashMap::new(),
            registrations: DashMap::new(),
            names: DashMap::new(),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            listener: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Starts listening on `port` (0 = OS-assigned) and returns the bound address.
    ///
    /// Enabling an enabled access point returns the current address.
    pub async fn enable(&self, port: u16) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((self.inner.config.bind, port)).await?;
        let addr = listener.local_addr()?;

        let mut slot = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            // Lost a race with a concurrent enable.
            return Ok(existing.addr);
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner), shutdown_rx));
        *slot = Some(Listener { addr, shutdown, task });

        info!(%addr, identity = %self.inner.config.identity, "access point enabled");
        Ok(addr)
    }

    /// Enables on the configured port.
    pub async fn enable_default(&self) -> std::io::Result<SocketAddr> {
        self.enable(self.inner.config.port).await
    }

    /// Stops listening and tears down every session.
    pub fn disable(&self) {
        let listener = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(listener) = listener else {
            return;
        };
        let _ = listener.shutdown.send(());
        listener.task.abort();

        for session in self.inner.session_snapshot() {
            session.close();
        }
        info!(addr = %listener.addr, "access point disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner).as_ref().map(|l| l.addr)
    }

    /// Adds a component and registers every object its markup declares.
    pub fn add_component<C: Component>(&self, component: Arc<C>) -> Result<(), RegistryError> {
        let component: Arc<dyn Component> = component;
        let name = component.name().to_string();
        if self.inner.components.contains_key(&name) {
            return Err(RegistryError::DuplicateComponent(name));
        }
        self.inner.components.insert(name.clone(), component.clone());
        debug!(component = %name, "component added");

        for decl in component.exposed_objects() {
            self.inner.register(&name, &decl.object, &decl.name, decl.permissions)?;
        }
        Ok(())
    }

    /// Exposes `object` as `<owner>.<name>`.
    pub fn register_object<T: ExposedObject>(
        &self,
        owner: &str,
        object: &Arc<T>,
        name: &str,
        permissions: Permissions,
    ) -> Result<ObjectKey, RegistryError> {
        let object: Arc<dyn ExposedObject> = object.clone();
        self.inner.register(owner, &object, name, permissions)
    }

    /// Registers `object` and returns a guard that owns it. Dropping the guard
    /// reports the object destroyed.
    pub fn expose<T: ExposedObject>(
        &self,
        owner: &str,
        object: Arc<T>,
        name: &str,
        permissions: Permissions,
    ) -> Result<Exposed<T>, RegistryError> {
        let key = self.register_object(owner, &object, name, permissions)?;
        Ok(Exposed { object, key, access_point: Arc::downgrade(&self.inner) })
    }

    /// Withdraws the registration without destroying the object.
    pub fn unregister_object<T: ?Sized>(&self, owner: &str, object: &Arc<T>) -> Result<(), RegistryError> {
        let key = ObjectKey::of(object);
        let owned = self
            .inner
            .registrations
            .get(&key)
            .is_some_and(|reg| reg.component.name() == owner);
        if !owned {
            return Err(RegistryError::NotRegistered);
        }
        self.inner.revoke(key);
        Ok(())
    }

    /// Destruction hook: revokes the registration and makes every session
    /// forget the object, telling its peer with an unsolicited `ReleaseObject`.
    pub fn object_destroyed(&self, key: ObjectKey) {
        self.inner.revoke(key);
    }

    /// Looks up a live object by `component.name`.
    pub fn resolve(&self, full_name: &str, for_remote_access: bool) -> Result<Resolved, ResolveError> {
        self.inner.resolve(full_name, for_remote_access)
    }

    /// Live sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.inner.session_snapshot().iter().map(Session::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl Inner {
    fn is_enabled(&self) -> bool {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn session_snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    fn register(
        &self,
        owner: &str,
        object: &Arc<dyn ExposedObject>,
        name: &str,
        permissions: Permissions,
    ) -> Result<ObjectKey, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let component = match self.components.get(owner) {
            Some(entry) => entry.value().clone(),
            None => return Err(RegistryError::UnknownComponent(owner.to_string())),
        };

        let key = ObjectKey::of(object);
        if let Some(existing) = self.registrations.get(&key) {
            if existing.object.upgrade().is_some() {
                return Err(RegistryError::AlreadyRegistered(existing.full_name.clone()));
            }
        }

        let full_name = format!("{}.{}", owner, name);
        let taken = self
            .names
            .get(&full_name)
            .map(|entry| *entry.value())
            .and_then(|other| self.registrations.get(&other).map(|reg| reg.object.upgrade().is_some()))
            .unwrap_or(false);
        if taken {
            return Err(RegistryError::NameTaken(full_name));
        }

        let registration = Registration {
            component,
            name: name.to_string(),
            full_name: full_name.clone(),
            object: Arc::downgrade(object),
            permissions,
        };
        if let Some(stale) = self.registrations.insert(key, registration) {
            self.names.remove_if(&stale.full_name, |_, k| *k == key);
        }
        self.names.insert(full_name.clone(), key);

        info!(object = %full_name, %key, "object exposed");
        Ok(key)
    }

    fn revoke(&self, key: ObjectKey) {
        if let Some((_, reg)) = self.registrations.remove(&key) {
            self.names.remove_if(&reg.full_name, |_, k| *k == key);
            info!(object = %reg.full_name, %key, "object revoked");
        }
        for session in self.session_snapshot() {
            session.forget_object(key);
        }
    }

    fn resolve(&self, full_name: &str, for_remote_access: bool) -> Result<Resolved, ResolveError> {
        let not_found = || ResolveError::NotFound(full_name.to_string());

        let (component_name, _) = full_name.split_once('.').ok_or_else(not_found)?;
        if !self.components.contains_key(component_name) {
            return Err(not_found());
        }
        let key = self.names.get(full_name).map(|entry| *entry.value()).ok_or_else(not_found)?;
        let reg = self.registrations.get(&key).ok_or_else(not_found)?;
        let object = reg.object.upgrade().ok_or_else(not_found)?;

        if for_remote_access && reg.permissions.disallow_remote_access {
            return Err(ResolveError::AccessDenied(full_name.to_string()));
        }

        Ok(Resolved {
            key,
            object,
            component: reg.component.clone(),
            name: reg.name.clone(),
            full_name: reg.full_name.clone(),
            permissions: reg.permissions,
        })
    }
}

async fn accept_loop(listener: TcpListener, access_point: Weak<Inner>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if back_off_after_accept_error(&e, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                };
                let Some(inner) = access_point.upgrade() else {
                    break;
                };
                let id = SessionId(inner.next_session.fetch_add(1, Ordering::Relaxed));
                let session = Session::start(stream, peer, id, &inner);
                inner.sessions.insert(id, session.clone());
                // The peer may already be gone, and teardown ran before the insert.
                if session.is_closed() {
                    inner.sessions.remove(&id);
                }
            }
        }
    }
    debug!("accept loop finished");
}

/// Waits out a failed accept so a persistent error (e.g. EMFILE) does not spin
/// the loop. Returns true if shutdown was requested meanwhile.
pub(crate) async fn back_off_after_accept_error(e: &std::io::Error, shutdown: &mut oneshot::Receiver<()>) -> bool {
    error!(error = %e, "accept failed");
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
    }
}

/// Owns an exposed object. Dropping it reports the object destroyed to the
/// access point that exposed it.
pub struct Exposed<T: ExposedObject> {
    object: Arc<T>,
    key: ObjectKey,
    access_point: Weak<Inner>,
}

impl<T: ExposedObject> Exposed<T> {
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn object(&self) -> &Arc<T> {
        &self.object
    }
}

impl<T: ExposedObject> std::ops::Deref for Exposed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: ExposedObject> Drop for Exposed<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.access_point.upgrade() {
            inner.revoke(self.key);
        }
    }
}
