//! # Message Set
//!
//! Every message is a correlation id, a typed body and a free-form context bag.
//! Responses reuse the id of the request they answer.
//!
//! ## Invariants
//! - Type codes are fixed on the wire. The direction a code may travel is
//!   derived from its bit pattern, not stored.
//! - `NO_OBJECT` (−1) stands in for "no such object" wherever an id is expected.

use std::collections::BTreeMap;
use std::fmt;

use remopack::Value;

/// Transient object id meaning "no object".
pub const NO_OBJECT: i32 = -1;

/// Free-form key/value bag travelling with a message.
pub type Context = BTreeMap<String, Value>;

/// Which side of a connection may originate a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Both,
}

/// The local end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Wire type tags.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    RequestAccess = 0x00f1,
    RequestAccessRes = 0x0f02,
    RequestObject = 0x00f3,
    RequestObjectRes = 0x0f04,
    GetPropertyNames = 0x00f5,
    GetPropertyNamesRes = 0x0f06,
    SetProperty = 0x00f7,
    SetPropertyRes = 0x0f08,
    GetProperty = 0x00f9,
    GetPropertyRes = 0x0f0a,
    InvokeMethod = 0x00fb,
    InvokeMethodRes = 0x0f0c,
    RequestConnection = 0x00fd,
    RequestConnectionRes = 0x0f0e,
    EventDelivery = 0x0fff,
    ReleaseObject = 0x1000,
    ReleaseObjectRes = 0x0f11,
    ReleaseAccess = 0x1002,
    ReleaseAccessRes = 0x0f13,
    ReleaseConnection = 0x1004,
    ReleaseConnectionRes = 0x0f15,
}

impl MessageType {
    pub const ALL: [MessageType; 21] = [
        MessageType::RequestAccess,
        MessageType::RequestAccessRes,
        MessageType::RequestObject,
        MessageType::RequestObjectRes,
        MessageType::GetPropertyNames,
        MessageType::GetPropertyNamesRes,
        MessageType::SetProperty,
        MessageType::SetPropertyRes,
        MessageType::GetProperty,
        MessageType::GetPropertyRes,
        MessageType::InvokeMethod,
        MessageType::InvokeMethodRes,
        MessageType::RequestConnection,
        MessageType::RequestConnectionRes,
        MessageType::EventDelivery,
        MessageType::ReleaseObject,
        MessageType::ReleaseObjectRes,
        MessageType::ReleaseAccess,
        MessageType::ReleaseAccessRes,
        MessageType::ReleaseConnection,
        MessageType::ReleaseConnectionRes,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::RequestAccess => "RequestAccess",
            MessageType::RequestAccessRes => "RequestAccessRes",
            MessageType::RequestObject => "RequestObject",
            MessageType::RequestObjectRes => "RequestObjectRes",
            MessageType::GetPropertyNames => "GetPropertyNames",
            MessageType::GetPropertyNamesRes => "GetPropertyNamesRes",
            MessageType::SetProperty => "SetProperty",
            MessageType::SetPropertyRes => "SetPropertyRes",
            MessageType::GetProperty => "GetProperty",
            MessageType::GetPropertyRes => "GetPropertyRes",
            MessageType::InvokeMethod => "InvokeMethod",
            MessageType::InvokeMethodRes => "InvokeMethodRes",
            MessageType::RequestConnection => "RequestConnection",
            MessageType::RequestConnectionRes => "RequestConnectionRes",
            MessageType::EventDelivery => "EventDelivery",
            MessageType::ReleaseObject => "ReleaseObject",
            MessageType::ReleaseObjectRes => "ReleaseObjectRes",
            MessageType::ReleaseAccess => "ReleaseAccess",
            MessageType::ReleaseAccessRes => "ReleaseAccessRes",
            MessageType::ReleaseConnection => "ReleaseConnection",
            MessageType::ReleaseConnectionRes => "ReleaseConnectionRes",
        }
    }

    /// Direction encoded in the code's bit pattern.
    pub fn direction(self) -> Direction {
        let code = self.code();
        if code & 0x0ff0 == 0x0ff0 || code >= 0x1000 {
            Direction::Both
        } else if code & 0x00f0 == 0x00f0 {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Whether an endpoint playing `role` may send this type.
    pub fn sendable_by(self, role: Role) -> bool {
        match (self.direction(), role) {
            (Direction::Both, _) => true,
            (Direction::ClientToServer, Role::Client) => true,
            (Direction::ServerToClient, Role::Server) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    RequestAccess { app_name: String },
    RequestAccessRes { granted: bool },
    RequestObject { name: String },
    /// `object_id` is `NO_OBJECT` when the request was refused.
    RequestObjectRes { object_id: i32 },
    GetPropertyNames { object_id: i32 },
    GetPropertyNamesRes { object_id: i32, names: Vec<String> },
    SetProperty { object_id: i32, name: String, value: Value },
    SetPropertyRes { object_id: i32, name: String, value: Value, success: bool },
    GetProperty { object_id: i32, name: String },
    GetPropertyRes { object_id: i32, name: String, value: Value, success: bool },
    InvokeMethod { object_id: i32, method: String, args: Vec<Value> },
    InvokeMethodRes { object_id: i32, method: String, value: Value, success: bool },
    RequestConnection { object_id: i32, event: String },
    RequestConnectionRes { object_id: i32, event: String, success: bool },
    EventDelivery { object_id: i32, event: String, args: Vec<Value> },
    ReleaseObject { object_id: i32 },
    ReleaseObjectRes { object_id: i32, success: bool },
    ReleaseAccess,
    ReleaseAccessRes { success: bool },
    ReleaseConnection { object_id: i32, event: String },
    ReleaseConnectionRes { object_id: i32, event: String, success: bool },
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::RequestAccess { .. } => MessageType::RequestAccess,
            Body::RequestAccessRes { .. } => MessageType::RequestAccessRes,
            Body::RequestObject { .. } => MessageType::RequestObject,
            Body::RequestObjectRes { .. } => MessageType::RequestObjectRes,
            Body::GetPropertyNames { .. } => MessageType::GetPropertyNames,
            Body::GetPropertyNamesRes { .. } => MessageType::GetPropertyNamesRes,
            Body::SetProperty { .. } => MessageType::SetProperty,
            Body::SetPropertyRes { .. } => MessageType::SetPropertyRes,
            Body::GetProperty { .. } => MessageType::GetProperty,
            Body::GetPropertyRes { .. } => MessageType::GetPropertyRes,
            Body::InvokeMethod { .. } => MessageType::InvokeMethod,
            Body::InvokeMethodRes { .. } => MessageType::InvokeMethodRes,
            Body::RequestConnection { .. } => MessageType::RequestConnection,
            Body::RequestConnectionRes { .. } => MessageType::RequestConnectionRes,
            Body::EventDelivery { .. } => MessageType::EventDelivery,
            Body::ReleaseObject { .. } => MessageType::ReleaseObject,
            Body::ReleaseObjectRes { .. } => MessageType::ReleaseObjectRes,
            Body::ReleaseAccess => MessageType::ReleaseAccess,
            Body::ReleaseAccessRes { .. } => MessageType::ReleaseAccessRes,
            Body::ReleaseConnection { .. } => MessageType::ReleaseConnection,
            Body::ReleaseConnectionRes { .. } => MessageType::ReleaseConnectionRes,
        }
    }

    /// The transient object id the body refers to, if its type carries one.
    pub fn object_id(&self) -> Option<i32> {
        match self {
            Body::RequestObjectRes { object_id }
            | Body::GetPropertyNames { object_id }
            | Body::GetPropertyNamesRes { object_id, .. }
            | Body::SetProperty { object_id, .. }
            | Body::SetPropertyRes { object_id, .. }
            | Body::GetProperty { object_id, .. }
            | Body::GetPropertyRes { object_id, .. }
            | Body::InvokeMethod { object_id, .. }
            | Body::InvokeMethodRes { object_id, .. }
            | Body::RequestConnection { object_id, .. }
            | Body::RequestConnectionRes { object_id, .. }
            | Body::EventDelivery { object_id, .. }
            | Body::ReleaseObject { object_id }
            | Body::ReleaseObjectRes { object_id, .. }
            | Body::ReleaseConnection { object_id, .. }
            | Body::ReleaseConnectionRes { object_id, .. } => Some(*object_id),
            Body::RequestAccess { .. }
            | Body::RequestAccessRes { .. }
            | Body::RequestObject { .. }
            | Body::ReleaseAccess
            | Body::ReleaseAccessRes { .. } => None,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i32,
    pub body: Body,
    pub context: Context,
}

impl Message {
    pub fn new(id: i32, body: Body) -> Self {
        Self { id, body, context: Context::new() }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn object_id(&self) -> Option<i32> {
        self.body.object_id()
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    write!(f, "(")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    write!(f, ")")
}

/// One human-readable line, used by transcripts.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.message_type(), self.id)?;
        match &self.body {
            Body::RequestAccess { app_name } => write!(f, " app={:?}", app_name)?,
            Body::RequestAccessRes { granted } => write!(f, " granted={}", granted)?,
            Body::RequestObject { name } => write!(f, " name={:?}", name)?,
            Body::RequestObjectRes { object_id } => write!(f, " object={}", object_id)?,
            Body::GetPropertyNames { object_id } => write!(f, " object={}", object_id)?,
            Body::GetPropertyNamesRes { object_id, names } => {
                write!(f, " object={} names={:?}", object_id, names)?
            }
            Body::SetProperty { object_id, name, value } => {
                write!(f, " object={} {}={}", object_id, name, value)?
            }
            Body::SetPropertyRes { object_id, name, value, success }
            | Body::GetPropertyRes { object_id, name, value, success } => {
                write!(f, " object={} {}={} success={}", object_id, name, value, success)?
            }
            Body::GetProperty { object_id, name } => write!(f, " object={} {}", object_id, name)?,
            Body::InvokeMethod { object_id, method, args } => {
                write!(f, " object={} {}", object_id, method)?;
                write_values(f, args)?
            }
            Body::InvokeMethodRes { object_id, method, value, success } => {
                write!(f, " object={} {} -> {} success={}", object_id, method, value, success)?
            }
            Body::RequestConnection { object_id, event }
            | Body::ReleaseConnection { object_id, event } => {
                write!(f, " object={} event={}", object_id, event)?
            }
            Body::RequestConnectionRes { object_id, event, success }
            | Body::ReleaseConnectionRes { object_id, event, success } => {
                write!(f, " object={} event={} success={}", object_id, event, success)?
            }
            Body::EventDelivery { object_id, event, args } => {
                write!(f, " object={} {}", object_id, event)?;
                write_values(f, args)?
            }
            Body::ReleaseObject { object_id } => write!(f, " object={}", object_id)?,
            Body::ReleaseObjectRes { object_id, success } => {
                write!(f, " object={} success={}", object_id, success)?
            }
            Body::ReleaseAccess => {}
            Body::ReleaseAccessRes { success } => write!(f, " success={}", success)?,
        }
        Ok(())
    }
}
