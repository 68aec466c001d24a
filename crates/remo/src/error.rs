//! # Error Definitions
//!
//! One enum per layer. Protocol-level refusals are not errors on the server
//! side (they become negative replies); they surface here only where a local
//! caller needs to know.

use remowire::MessageType;

/// Registration of components and exposed objects failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The owning component was never added to the access point.
    UnknownComponent(String),
    /// A component with this name is already present.
    DuplicateComponent(String),
    /// Exposed objects need a non-empty name.
    EmptyName,
    /// Another live object already answers to this full name.
    NameTaken(String),
    /// The object is already registered under another name.
    AlreadyRegistered(String),
    /// The object has no registration (or belongs to another component).
    NotRegistered,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownComponent(name) => write!(f, "unknown component '{}'", name),
            Self::DuplicateComponent(name) => write!(f, "component '{}' already added", name),
            Self::EmptyName => write!(f, "exposed object name is empty"),
            Self::NameTaken(name) => write!(f, "'{}' is already exposed", name),
            Self::AlreadyRegistered(name) => write!(f, "object already exposed as '{}'", name),
            Self::NotRegistered => write!(f, "object is not registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A full object name could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No component, or no live object, answers to the name.
    NotFound(String),
    /// The object exists but is marked as not remotely accessible.
    AccessDenied(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "no exposed object named '{}'", name),
            Self::AccessDenied(name) => write!(f, "remote access to '{}' is disallowed", name),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Failures of the object model itself (bad member, rejected write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    NoSuchMember(String),
    BadArguments(String),
    ReadOnly(String),
    Failed(String),
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchMember(name) => write!(f, "no member '{}'", name),
            Self::BadArguments(msg) => write!(f, "bad arguments: {}", msg),
            Self::ReadOnly(name) => write!(f, "property '{}' is read-only", name),
            Self::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ObjectError {}

/// Connection-level failures on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// There is no open connection to send on.
    NotConnected,
    /// The writer side has shut down.
    Closed,
    /// This end of the connection may not originate the message type.
    Misdirected(MessageType),
    /// The message could not be encoded.
    Encode(remowire::Error),
    /// Socket-level failure.
    Io(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Closed => write!(f, "connection closed"),
            Self::Misdirected(ty) => write!(f, "{} may not be sent from this end", ty),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<remowire::Error> for LinkError {
    fn from(e: remowire::Error) -> Self { Self::Encode(e) }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self { Self::Io(e.to_string()) }
}

/// Errors surfaced by `RemoteObject` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// The proxy has no transient id; activate it first.
    NotActive,
    /// The server refused to hand out the object.
    CouldNotActivate,
    /// The connection dropped before a reply arrived.
    Disconnected,
    /// The server answered with a negative reply.
    Refused(MessageType),
    /// The server answered with an unexpected message.
    UnexpectedReply(MessageType),
    /// The proxy was released.
    Released,
    Link(LinkError),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActive => write!(f, "proxy is not active"),
            Self::CouldNotActivate => write!(f, "remote object could not be activated"),
            Self::Disconnected => write!(f, "disconnected before reply"),
            Self::Refused(ty) => write!(f, "{} refused by server", ty),
            Self::UnexpectedReply(ty) => write!(f, "unexpected reply {}", ty),
            Self::Released => write!(f, "proxy was released"),
            Self::Link(e) => write!(f, "link error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Link(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LinkError> for ProxyError {
    fn from(e: LinkError) -> Self { Self::Link(e) }
}
