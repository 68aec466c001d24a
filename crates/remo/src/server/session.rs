//! # Remote Session
//!
//! Server-side state for one accepted connection: the access grant, the
//! transient-id table and the active event forwarders.
//!
//! The reader task loops Idle → Framing → Dispatch until the peer goes away,
//! the stream turns out corrupt, or the session is closed locally. Every
//! request gets exactly one reply, negative when the object is unknown, dead
//! or not permitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use remowire::Body;
use remowire::FrameBuffer;
use remowire::FrameLimits;
use remowire::Message;
use remowire::NO_OBJECT;
use remowire::Role;
use remowire::Value;

use crate::access::Operation;
use crate::access::Permissions;
use crate::access::permitted;
use crate::caller::RemoteCaller;
use crate::caller::SessionId;
use crate::error::LinkError;
use crate::object::Component;
use crate::object::ExposedObject;
use crate::object::ObjectKey;
use crate::outbox::Outbox;
use crate::server::Inner as AccessPointInner;
use crate::server::Resolved;
use crate::server::SessionInfo;
use crate::server::forwarder::EventForwarder;
use crate::server::forwarder::Route;

const READ_CHUNK: usize = 16 * 1024;

/// Ids for messages this end originates.
#[derive(Clone)]
pub(crate) struct MessageIds(Arc<AtomicI32>);

impl MessageIds {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(1)))
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// One row of the transient-id table.
#[derive(Clone)]
struct IdEntry {
    key: ObjectKey,
    object: Weak<dyn ExposedObject>,
    component: Arc<dyn Component>,
    name: String,
    permissions: Permissions,
}

enum Flow {
    Continue,
    Close,
}

struct SessionInner {
    id: SessionId,
    caller: RemoteCaller,
    access_point: Weak<AccessPointInner>,
    outbox: Outbox,
    granted: AtomicBool,
    objects: DashMap<i32, IdEntry>,
    keys: DashMap<ObjectKey, i32>,
    next_object_id: AtomicI32,
    message_ids: MessageIds,
    forwarders: DashMap<(ObjectKey, String), EventForwarder>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wraps an accepted stream and spawns its reader and writer tasks.
    pub fn start(stream: TcpStream, peer: SocketAddr, id: SessionId, access_point: &Arc<AccessPointInner>) -> Self {
        let config = &access_point.config;
        let (reader, writer) = stream.into_split();
        let outbox = Outbox::spawn(
            Role::Server,
            id.to_string(),
            config.retry_delay,
            config.transcript.clone(),
            writer,
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                caller: RemoteCaller::new(id, peer),
                access_point: Arc::downgrade(access_point),
                outbox,
                granted: AtomicBool::new(false),
                objects: DashMap::new(),
                keys: DashMap::new(),
                next_object_id: AtomicI32::new(1),
                message_ids: MessageIds::new(),
                forwarders: DashMap::new(),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        };

        info!(session = %id, %peer, "session opened");
        tokio::spawn(session.clone().read_loop(reader, config.limits, shutdown_rx));
        session
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.inner.id,
            peer: self.inner.caller.peer,
            access_granted: self.inner.granted.load(Ordering::Acquire),
            objects: self.inner.objects.len(),
        }
    }

    /// Tears the session down now. The reader task exits on its next wakeup.
    pub fn close(&self) {
        self.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drops every id and forwarder held for `key` and tells the peer.
    pub fn forget_object(&self, key: ObjectKey) {
        let Some((_, object_id)) = self.inner.keys.remove(&key) else {
            return;
        };
        self.inner.objects.remove(&object_id);
        self.drop_forwarders(key);

        debug!(session = %self.inner.id, id = object_id, "object gone, releasing");
        let msg = Message::new(self.inner.message_ids.next(), Body::ReleaseObject { object_id });
        let _ = self.inner.outbox.send(&msg);
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, limits: FrameLimits, mut shutdown: watch::Receiver<bool>) {
        let mut frames = FrameBuffer::new(limits);
        let mut chunk = vec![0u8; READ_CHUNK];
        let session = self.inner.id;

        'read: loop {
            if *shutdown.borrow() {
                break;
            }
            let n = tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        debug!(%session, "peer closed the connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%session, error = %e, "read failed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };

            if let Err(e) = frames.extend(&chunk[..n]) {
                warn!(%session, error = %e, "resetting corrupt stream");
                break;
            }
            loop {
                match frames.next_message() {
                    Ok(Some(msg)) => {
                        if let Flow::Close = self.dispatch(msg) {
                            break 'read;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%session, error = %e, "resetting corrupt stream");
                        break 'read;
                    }
                }
            }
        }

        self.teardown();
    }

    fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let keys: Vec<(ObjectKey, String)> = self.inner.forwarders.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, forwarder)) = self.inner.forwarders.remove(&key) {
                forwarder.detach();
            }
        }
        self.inner.objects.clear();
        self.inner.keys.clear();
        self.inner.outbox.close();

        if let Some(access_point) = self.inner.access_point.upgrade() {
            access_point.sessions.remove(&self.inner.id);
        }
        info!(session = %self.inner.id, peer = %self.inner.caller.peer, "session closed");
    }

    /// Sends a reply. A value the codec cannot carry turns the reply into
    /// its negative form instead of leaving the request unanswered.
    fn reply(&self, id: i32, body: Body) {
        let fallback = unencodable_fallback(&body);
        let e = match self.inner.outbox.send(&Message::new(id, body)) {
            Ok(()) => return,
            Err(e) => e,
        };
        match (e, fallback) {
            (LinkError::Encode(e), Some(body)) => {
                warn!(session = %self.inner.id, id, error = %e, "reply value not encodable, refusing");
                if let Err(e) = self.inner.outbox.send(&Message::new(id, body)) {
                    debug!(session = %self.inner.id, error = %e, "reply dropped");
                }
            }
            (e, _) => debug!(session = %self.inner.id, error = %e, "reply dropped"),
        }
    }

    fn dispatch(&self, msg: Message) -> Flow {
        self.inner.outbox.note_received(&msg);
        let Some(access_point) = self.inner.access_point.upgrade() else {
            return Flow::Close;
        };
        let id = msg.id;

        match msg.body {
            Body::RequestAccess { app_name } => {
                let granted = app_name == access_point.config.identity && access_point.is_enabled();
                self.inner.granted.store(granted, Ordering::Release);
                info!(session = %self.inner.id, app = %app_name, granted, "access requested");
                self.reply(id, Body::RequestAccessRes { granted });
            }
            Body::RequestObject { name } => {
                let object_id = self.request_object(&access_point, &name);
                self.reply(id, Body::RequestObjectRes { object_id });
            }
            Body::GetPropertyNames { object_id } => {
                let names = self
                    .lookup(object_id)
                    .filter(|(entry, object)| self.check(entry, object, &Operation::Access))
                    .map(|(_, object)| object.property_names())
                    .unwrap_or_default();
                self.reply(id, Body::GetPropertyNamesRes { object_id, names });
            }
            Body::GetProperty { object_id, name } => {
                let value = self
                    .lookup(object_id)
                    .filter(|(entry, object)| self.check(entry, object, &Operation::GetProperty(&name)))
                    .and_then(|(_, object)| object.property(&name, &self.inner.caller));
                let success = value.is_some();
                self.reply(id, Body::GetPropertyRes {
                    object_id,
                    name,
                    value: value.unwrap_or_default(),
                    success,
                });
            }
            Body::SetProperty { object_id, name, value } => {
                let (success, value) = self.set_property(object_id, &name, value);
                self.reply(id, Body::SetPropertyRes { object_id, name, value, success });
            }
            Body::InvokeMethod { object_id, method, args } => {
                let (success, value) = self.invoke(object_id, &method, &args);
                self.reply(id, Body::InvokeMethodRes { object_id, method, value, success });
            }
            Body::RequestConnection { object_id, event } => {
                let success = self.request_connection(object_id, &event);
                let event = if success { event } else { String::new() };
                self.reply(id, Body::RequestConnectionRes { object_id, event, success });
            }
            Body::ReleaseConnection { object_id, event } => {
                let success = self.release_connection(object_id, &event);
                self.reply(id, Body::ReleaseConnectionRes { object_id, event, success });
            }
            Body::ReleaseObject { object_id } => {
                let success = self.release_object(object_id);
                self.reply(id, Body::ReleaseObjectRes { object_id, success });
            }
            Body::ReleaseAccess => {
                self.reply(id, Body::ReleaseAccessRes { success: true });
                return Flow::Close;
            }
            Body::EventDelivery { event, .. } => {
                debug!(session = %self.inner.id, %event, "ignoring event delivered by client");
            }
            other => {
                warn!(session = %self.inner.id, kind = %other.message_type(), "ignoring misdirected message");
            }
        }
        Flow::Continue
    }

    fn request_object(&self, access_point: &AccessPointInner, name: &str) -> i32 {
        if !self.inner.granted.load(Ordering::Acquire) {
            return NO_OBJECT;
        }
        let resolved = match access_point.resolve(name, true) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(session = %self.inner.id, error = %e, "object request refused");
                return NO_OBJECT;
            }
        };
        let allowed = permitted(
            resolved.component.as_ref(),
            &resolved.name,
            resolved.object.as_ref(),
            &resolved.permissions,
            &Operation::Access,
            &self.inner.caller,
        );
        if !allowed {
            debug!(session = %self.inner.id, object = %resolved.full_name, "object access denied");
            return NO_OBJECT;
        }
        self.mint(resolved)
    }

    /// Returns the session's id for the object, minting one on first request.
    fn mint(&self, resolved: Resolved) -> i32 {
        let existing = self.inner.keys.get(&resolved.key).map(|entry| *entry.value());
        if let Some(object_id) = existing {
            let alive = self
                .inner
                .objects
                .get(&object_id)
                .is_some_and(|entry| entry.object.upgrade().is_some());
            if alive {
                return object_id;
            }
            self.release_object(object_id);
        }

        let object_id = self.inner.next_object_id.fetch_add(1, Ordering::Relaxed);
        self.inner.objects.insert(object_id, IdEntry {
            key: resolved.key,
            object: Arc::downgrade(&resolved.object),
            component: resolved.component,
            name: resolved.name,
            permissions: resolved.permissions,
        });
        self.inner.keys.insert(resolved.key, object_id);
        debug!(session = %self.inner.id, id = object_id, object = %resolved.full_name, "object id minted");
        object_id
    }

    /// Resolves a transient id to its live object. Nothing is reachable
    /// before access has been granted.
    fn lookup(&self, object_id: i32) -> Option<(IdEntry, Arc<dyn ExposedObject>)> {
        if !self.inner.granted.load(Ordering::Acquire) {
            return None;
        }
        let entry = self.inner.objects.get(&object_id).map(|e| e.value().clone())?;
        let object = entry.object.upgrade()?;
        Some((entry, object))
    }

    fn check(&self, entry: &IdEntry, object: &Arc<dyn ExposedObject>, op: &Operation<'_>) -> bool {
        permitted(
            entry.component.as_ref(),
            &entry.name,
            object.as_ref(),
            &entry.permissions,
            op,
            &self.inner.caller,
        )
    }

    fn set_property(&self, object_id: i32, name: &str, value: Value) -> (bool, Value) {
        let caller = &self.inner.caller;
        let Some((entry, object)) = self.lookup(object_id) else {
            return (false, Value::Null);
        };
        if self.check(&entry, &object, &Operation::SetProperty(name)) {
            match object.set_property(name, value.clone(), caller) {
                Ok(()) => return (true, object.property(name, caller).unwrap_or(value)),
                Err(e) => debug!(session = %self.inner.id, error = %e, "set property failed"),
            }
        }
        (false, object.property(name, caller).unwrap_or_default())
    }

    fn invoke(&self, object_id: i32, method: &str, args: &[Value]) -> (bool, Value) {
        let Some((entry, object)) = self.lookup(object_id) else {
            return (false, Value::Null);
        };
        if !object.has_method(method, args.len()) {
            return (false, Value::Null);
        }
        if !self.check(&entry, &object, &Operation::InvokeMethod(method)) {
            debug!(session = %self.inner.id, %method, "invocation denied");
            return (false, Value::Null);
        }
        match object.invoke(method, args, &self.inner.caller) {
            Ok(value) => (true, value),
            Err(e) => {
                debug!(session = %self.inner.id, %method, error = %e, "invocation failed");
                (false, Value::Null)
            }
        }
    }

    fn request_connection(&self, object_id: i32, event: &str) -> bool {
        let Some((entry, object)) = self.lookup(object_id) else {
            return false;
        };
        if !object.has_event(event) || !self.check(&entry, &object, &Operation::SubscribeEvent(event)) {
            return false;
        }
        let slot = (entry.key, event.to_string());
        if self.inner.forwarders.contains_key(&slot) {
            return true;
        }

        let route = Route {
            component: entry.component.clone(),
            name: entry.name.clone(),
            object: entry.object.clone(),
            permissions: entry.permissions,
            caller: self.inner.caller.clone(),
            object_id,
            event: event.to_string(),
        };
        let outbox = self.inner.outbox.clone();
        match EventForwarder::attach(&object, route, outbox, self.inner.message_ids.clone()) {
            Some(forwarder) => {
                self.inner.forwarders.insert(slot, forwarder);
                debug!(session = %self.inner.id, id = object_id, %event, "event forwarder attached");
                true
            }
            None => false,
        }
    }

    fn release_connection(&self, object_id: i32, event: &str) -> bool {
        let Some(key) = self.inner.objects.get(&object_id).map(|e| e.key) else {
            return false;
        };
        match self.inner.forwarders.remove(&(key, event.to_string())) {
            Some((_, forwarder)) => {
                forwarder.detach();
                true
            }
            None => false,
        }
    }

    fn release_object(&self, object_id: i32) -> bool {
        let Some((_, entry)) = self.inner.objects.remove(&object_id) else {
            return false;
        };
        self.inner.keys.remove_if(&entry.key, |_, id| *id == object_id);
        self.drop_forwarders(entry.key);
        true
    }

    fn drop_forwarders(&self, key: ObjectKey) {
        let slots: Vec<(ObjectKey, String)> = self
            .inner
            .forwarders
            .iter()
            .filter(|e| e.key().0 == key)
            .map(|e| e.key().clone())
            .collect();
        for slot in slots {
            if let Some((_, forwarder)) = self.inner.forwarders.remove(&slot) {
                forwarder.detach();
            }
        }
    }
}

/// The negative form of a value-carrying reply.
fn unencodable_fallback(body: &Body) -> Option<Body> {
    match body {
        Body::GetPropertyRes { object_id, name, .. } => Some(Body::GetPropertyRes {
            object_id: *object_id,
            name: name.clone(),
            value: Value::Null,
            success: false,
        }),
        Body::SetPropertyRes { object_id, name, .. } => Some(Body::SetPropertyRes {
            object_id: *object_id,
            name: name.clone(),
            value: Value::Null,
            success: false,
        }),
        Body::InvokeMethodRes { object_id, method, .. } => Some(Body::InvokeMethodRes {
            object_id: *object_id,
            method: method.clone(),
            value: Value::Null,
            success: false,
        }),
        _ => None,
    }
}
