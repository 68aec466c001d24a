//! # Access Control Chain
//!
//! Every gated operation is decided in two stages, component first.
//!
//! 1. **Component**: a native [`ComponentAccessControl`] must permit both the
//!    component and the named object. Without one, the component's declarative
//!    `allow_remote_access` flag decides.
//! 2. **Object**: a native [`ObjectAccessControl`] decides the access gate and
//!    the specific operation. Without one, the registration's [`Permissions`]
//!    decide.
//!
//! ## Invariants
//! - A native control that denies is final. Declarative flags are only
//!   consulted when no native control exists at that level.
//! - Absent flags deny.

use crate::caller::RemoteCaller;
use crate::object::Component;
use crate::object::ExposedObject;

/// Declarative per-object flags, computed once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub access: bool,
    pub invoke_method: bool,
    pub get_property: bool,
    pub set_property: bool,
    pub subscribe_event: bool,
    pub deliver_event: bool,
    /// Markup-level opt-out. Resolution for remote use fails regardless of
    /// the finer-grained flags.
    pub disallow_remote_access: bool,
}

impl Permissions {
    /// Every operation allowed.
    pub fn all() -> Self {
        Self {
            access: true,
            invoke_method: true,
            get_property: true,
            set_property: true,
            subscribe_event: true,
            deliver_event: true,
            disallow_remote_access: false,
        }
    }

    /// Nothing allowed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Access, property reads and events, but no writes or invocations.
    pub fn read_only() -> Self {
        Self {
            invoke_method: false,
            set_property: false,
            ..Self::all()
        }
    }

    pub fn with_invoke_method(mut self, allow: bool) -> Self {
        self.invoke_method = allow;
        self
    }

    pub fn with_get_property(mut self, allow: bool) -> Self {
        self.get_property = allow;
        self
    }

    pub fn with_set_property(mut self, allow: bool) -> Self {
        self.set_property = allow;
        self
    }

    pub fn with_subscribe_event(mut self, allow: bool) -> Self {
        self.subscribe_event = allow;
        self
    }

    pub fn with_deliver_event(mut self, allow: bool) -> Self {
        self.deliver_event = allow;
        self
    }

    pub fn disallow_remote_access(mut self) -> Self {
        self.disallow_remote_access = true;
        self
    }

    /// Whether the flags admit `op`. The access gate is always part of it.
    pub fn allows(&self, op: &Operation<'_>) -> bool {
        if !self.access {
            return false;
        }
        match op {
            Operation::Access => true,
            Operation::InvokeMethod(_) => self.invoke_method,
            Operation::GetProperty(_) => self.get_property,
            Operation::SetProperty(_) => self.set_property,
            Operation::SubscribeEvent(_) => self.subscribe_event,
            Operation::DeliverEvent(_) => self.deliver_event,
        }
    }
}

/// A gated operation and the member it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    Access,
    InvokeMethod(&'a str),
    GetProperty(&'a str),
    SetProperty(&'a str),
    SubscribeEvent(&'a str),
    DeliverEvent(&'a str),
}

/// Native component-level control.
pub trait ComponentAccessControl: Send + Sync {
    fn permits_component(&self, caller: &RemoteCaller) -> bool;
    fn permits_object(&self, object_name: &str, caller: &RemoteCaller) -> bool;
}

/// Native object-level control.
pub trait ObjectAccessControl: Send + Sync {
    /// Called once with `Operation::Access`, then again with the specific operation.
    fn permits(&self, op: &Operation<'_>, caller: &RemoteCaller) -> bool;
}

/// Runs the full chain for one operation.
pub(crate) fn permitted(
    component: &dyn Component,
    object_name: &str,
    object: &dyn ExposedObject,
    permissions: &Permissions,
    op: &Operation<'_>,
    caller: &RemoteCaller,
) -> bool {
    let component_ok = match component.access_control() {
        Some(ctrl) => {
            ctrl.permits_component(caller) && ctrl.permits_object(object_name, caller)
        }
        None => component.allow_remote_access(),
    };
    if !component_ok {
        return false;
    }

    match object.access_control() {
        Some(ctrl) => {
            ctrl.permits(&Operation::Access, caller)
                && (*op == Operation::Access || ctrl.permits(op, caller))
        }
        None => permissions.allows(op),
    }
}
