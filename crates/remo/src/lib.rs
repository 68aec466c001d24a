//! # Remo
//!
//! Remote object access between applications over one TCP connection per peer.
//!
//! A server-side [`AccessPoint`] exposes selected in-process objects. A client
//! obtains a [`RemoteAccessPoint`] from a [`ConnectionManager`], asks it for
//! named objects and drives them through [`RemoteObject`] proxies: method
//! invocation, property reads and writes, event subscription.
//!
//! ## Philosophy
//!
//! - **Capabilities, not reflection**: objects are reached through the
//!   [`ExposedObject`] trait. [`DynamicObject`] is a handler-table
//!   implementation for applications that have nothing better.
//! - **Explicit context**: access points and connection managers are ordinary
//!   values owned by the application. The caller of a remote operation is
//!   passed as a [`RemoteCaller`] argument.
//! - **Explicit lifetimes**: the registry only holds weak references. Whoever
//!   owns an object reports its destruction, usually by dropping an
//!   [`Exposed`] guard.
//!
//! ## Invariants
//!
//! - Transient object ids are scoped to one connection and never reused on it.
//! - Replies carry the id of the request they answer.
//! - Sends never block: a contended connection queues and retries.

mod access;
mod caller;
mod client;
mod config;
mod error;
mod object;
mod outbox;
mod server;

#[cfg(test)]
mod tests;

pub use access::ComponentAccessControl;
pub use access::ObjectAccessControl;
pub use access::Operation;
pub use access::Permissions;
pub use caller::RemoteCaller;
pub use caller::SessionId;
pub use client::ConnectionManager;
pub use client::EventStream;
pub use client::LinkEvent;
pub use client::ProxyEvent;
pub use client::RemoteAccessPoint;
pub use client::RemoteObject;
pub use config::ClientConfig;
pub use config::ServerConfig;
pub use config::Transcript;
pub use error::LinkError;
pub use error::ObjectError;
pub use error::ProxyError;
pub use error::RegistryError;
pub use error::ResolveError;
pub use object::AppComponent;
pub use object::Component;
pub use object::DynamicObject;
pub use object::DynamicObjectBuilder;
pub use object::EventSink;
pub use object::ExposedObject;
pub use object::ObjectDecl;
pub use object::ObjectKey;
pub use object::SubscriptionId;
pub use server::AccessPoint;
pub use server::Exposed;
pub use server::Resolved;
pub use server::SessionInfo;

pub use remowire::FrameLimits;
pub use remowire::Value;
