//! # Object Model
//!
//! The capabilities the protocol needs from an application: objects that can
//! be invoked, read, written and listened to, and components that own them.
//!
//! ## Philosophy
//!
//! - The protocol never inspects an object beyond these traits. Native
//!   reflection, generated glue or a handler table all fit behind them.
//! - Calls are synchronous and made from the connection's reader task; an
//!   object that needs to block should hand the work off itself.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use remowire::Value;

use crate::access::ComponentAccessControl;
use crate::access::ObjectAccessControl;
use crate::access::Permissions;
use crate::caller::RemoteCaller;
use crate::error::ObjectError;

/// Receives the arguments of each emission of a subscribed event.
pub type EventSink = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Handle returned by `ExposedObject::subscribe`.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct SubscriptionId(pub u64);

/// Pointer identity of a shared object. Two `Arc`s to the same object share a key.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object-{:#x}", self.0)
    }
}

/// An in-process object reachable by remote peers.
pub trait ExposedObject: Send + Sync + 'static {
    /// Whether a method with this name takes `arity` arguments.
    fn has_method(&self, name: &str, arity: usize) -> bool;

    fn invoke(&self, method: &str, args: &[Value], caller: &RemoteCaller) -> Result<Value, ObjectError>;

    /// Current value of a property, `None` if there is no such property.
    fn property(&self, name: &str, caller: &RemoteCaller) -> Option<Value>;

    fn set_property(&self, name: &str, value: Value, caller: &RemoteCaller) -> Result<(), ObjectError>;

    fn property_names(&self) -> Vec<String>;

    fn has_event(&self, name: &str) -> bool;

    /// Starts delivering `event` emissions to `sink`. `None` if there is no such event.
    fn subscribe(&self, event: &str, sink: EventSink) -> Option<SubscriptionId>;

    fn unsubscribe(&self, subscription: SubscriptionId);

    fn access_control(&self) -> Option<&dyn ObjectAccessControl> {
        None
    }
}

/// An object a component declares as exposed in its markup.
pub struct ObjectDecl {
    pub name: String,
    pub object: Arc<dyn ExposedObject>,
    pub permissions: Permissions,
}

impl ObjectDecl {
    pub fn new(name: impl Into<String>, object: Arc<dyn ExposedObject>, permissions: Permissions) -> Self {
        Self { name: name.into(), object, permissions }
    }
}

/// A unit of the application that owns exposed objects.
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Objects to register when the component is added to an access point.
    fn exposed_objects(&self) -> Vec<ObjectDecl> {
        Vec::new()
    }

    /// Declarative flag consulted when there is no native access control.
    fn allow_remote_access(&self) -> bool;

    fn access_control(&self) -> Option<&dyn ComponentAccessControl> {
        None
    }
}

/// A plain component: a name, its flag and its declared objects.
pub struct AppComponent {
    name: String,
    allow_remote_access: bool,
    declared: Vec<(String, Arc<dyn ExposedObject>, Permissions)>,
    access_control: Option<Box<dyn ComponentAccessControl>>,
}

impl AppComponent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow_remote_access: true,
            declared: Vec::new(),
            access_control: None,
        }
    }

    pub fn with_remote_access(mut self, allow: bool) -> Self {
        self.allow_remote_access = allow;
        self
    }

    /// Declares an object to be exposed as `<component>.<name>`.
    pub fn declare(mut self, name: impl Into<String>, object: Arc<dyn ExposedObject>, permissions: Permissions) -> Self {
        self.declared.push((name.into(), object, permissions));
        self
    }

    pub fn with_access_control(mut self, control: impl ComponentAccessControl + 'static) -> Self {
        self.access_control = Some(Box::new(control));
        self
    }
}

impl Component for AppComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn exposed_objects(&self) -> Vec<ObjectDecl> {
        self.declared
            .iter()
            .map(|(name, object, permissions)| ObjectDecl::new(name.clone(), object.clone(), *permissions))
            .collect()
    }

    fn allow_remote_access(&self) -> bool {
        self.allow_remote_access
    }

    fn access_control(&self) -> Option<&dyn ComponentAccessControl> {
        self.access_control.as_deref()
    }
}

type MethodFn = Box<dyn Fn(&[Value], &RemoteCaller) -> Result<Value, ObjectError> + Send + Sync>;

/// An `ExposedObject` backed by registered handlers.
///
/// Methods are looked up by name and argument count, so overloads by arity
/// are distinct entries.
pub struct DynamicObject {
    methods: HashMap<(String, usize), MethodFn>,
    properties: DashMap<String, Value>,
    writable: HashSet<String>,
    events: HashSet<String>,
    subscribers: DashMap<SubscriptionId, (String, EventSink)>,
    next_subscription: AtomicU64,
    access_control: Option<Box<dyn ObjectAccessControl>>,
}

impl DynamicObject {
    pub fn builder() -> DynamicObjectBuilder {
        DynamicObjectBuilder::default()
    }

    /// Emits `event` to every subscriber. Returns how many were reached.
    pub fn emit(&self, event: &str, args: &[Value]) -> usize {
        // Collect first so sinks run without holding map shards.
        let sinks: Vec<EventSink> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().0 == event)
            .map(|entry| entry.value().1.clone())
            .collect();
        for sink in &sinks {
            sink(args);
        }
        sinks.len()
    }

    /// Local (non-remote) property update. Ignores the writable set.
    pub fn set_local(&self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Local property read.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.properties.get(name).map(|v| v.value().clone())
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.iter().filter(|entry| entry.value().0 == event).count()
    }
}

impl ExposedObject for DynamicObject {
    fn has_method(&self, name: &str, arity: usize) -> bool {
        self.methods.contains_key(&(name.to_string(), arity))
    }

    fn invoke(&self, method: &str, args: &[Value], caller: &RemoteCaller) -> Result<Value, ObjectError> {
        let Some(handler) = self.methods.get(&(method.to_string(), args.len())) else {
            return Err(ObjectError::NoSuchMember(method.to_string()));
        };
        handler(args, caller)
    }

    fn property(&self, name: &str, _caller: &RemoteCaller) -> Option<Value> {
        self.get_local(name)
    }

    fn set_property(&self, name: &str, value: Value, _caller: &RemoteCaller) -> Result<(), ObjectError> {
        if !self.properties.contains_key(name) {
            return Err(ObjectError::NoSuchMember(name.to_string()));
        }
        if !self.writable.contains(name) {
            return Err(ObjectError::ReadOnly(name.to_string()));
        }
        self.properties.insert(name.to_string(), value);
        Ok(())
    }

    fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.properties.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn has_event(&self, name: &str) -> bool {
        self.events.contains(name)
    }

    fn subscribe(&self, event: &str, sink: EventSink) -> Option<SubscriptionId> {
        if !self.events.contains(event) {
            return None;
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.insert(id, (event.to_string(), sink));
        Some(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.subscribers.remove(&subscription);
    }

    fn access_control(&self) -> Option<&dyn ObjectAccessControl> {
        self.access_control.as_deref()
    }
}

/// Fluent builder for `DynamicObject`.
#[derive(Default)]
pub struct DynamicObjectBuilder {
    methods: HashMap<(String, usize), MethodFn>,
    properties: BTreeMap<String, (Value, bool)>,
    events: HashSet<String>,
    access_control: Option<Box<dyn ObjectAccessControl>>,
}

impl DynamicObjectBuilder {
    pub fn method<F>(mut self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(&[Value], &RemoteCaller) -> Result<Value, ObjectError> + Send + Sync + 'static,
    {
        self.methods.insert((name.into(), arity), Box::new(handler));
        self
    }

    /// A property remote peers may read and write.
    pub fn property(mut self, name: impl Into<String>, initial: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), (initial.into(), true));
        self
    }

    /// A property remote peers may only read.
    pub fn read_only_property(mut self, name: impl Into<String>, initial: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), (initial.into(), false));
        self
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.insert(name.into());
        self
    }

    pub fn access_control(mut self, control: impl ObjectAccessControl + 'static) -> Self {
        self.access_control = Some(Box::new(control));
        self
    }

    pub fn build(self) -> DynamicObject {
        let properties = DashMap::new();
        let mut writable = HashSet::new();
        for (name, (value, is_writable)) in self.properties {
            if is_writable {
                writable.insert(name.clone());
            }
            properties.insert(name, value);
        }

        DynamicObject {
            methods: self.methods,
            properties,
            writable,
            events: self.events,
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            access_control: self.access_control,
        }
    }
}
