//! # Message Codec
//!
//! Maps a `Message` to and from the payload of one frame.
//!
//! ## Layout
//! `Variant(<type name>) { Map { type: u32, id: s32, <fields>..., ctx: Map } }`
//!
//! ## Invariants
//! - **Forward Compatibility**: unknown map keys are skipped.
//! - The variant name must agree with the numeric `type` field.

use remopack::Decoder;
use remopack::Encoder;
use remopack::Value;

use crate::error::Error;
use crate::error::Result;
use crate::message::Body;
use crate::message::Context;
use crate::message::Message;
use crate::message::MessageType;

/// Encodes a message into a standalone payload (no frame header).
pub fn encode_payload(msg: &Message) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    write_message(&mut enc, msg)?;
    Ok(enc.into_bytes()?)
}

fn write_message(enc: &mut Encoder, msg: &Message) -> Result<()> {
    let ty = msg.message_type();
    enc.variant_begin(ty.name())?;
    enc.map_begin()?;

    write_u32(enc, "type", ty.code())?;
    write_i32(enc, "id", msg.id)?;

    match &msg.body {
        Body::RequestAccess { app_name } => write_str(enc, "app", app_name)?,
        Body::RequestAccessRes { granted } => write_bool(enc, "granted", *granted)?,
        Body::RequestObject { name } => write_str(enc, "name", name)?,
        Body::RequestObjectRes { object_id } => write_i32(enc, "object", *object_id)?,
        Body::GetPropertyNames { object_id } => write_i32(enc, "object", *object_id)?,
        Body::GetPropertyNamesRes { object_id, names } => {
            write_i32(enc, "object", *object_id)?;
            enc.variant_begin("names")?;
            enc.list_begin()?;
            for name in names {
                enc.str(name)?;
            }
            enc.list_end()?;
            enc.variant_end()?;
        }
        Body::SetProperty { object_id, name, value } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "name", name)?;
            write_value(enc, "value", value)?;
        }
        Body::SetPropertyRes { object_id, name, value, success }
        | Body::GetPropertyRes { object_id, name, value, success } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "name", name)?;
            write_value(enc, "value", value)?;
            write_bool(enc, "success", *success)?;
        }
        Body::GetProperty { object_id, name } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "name", name)?;
        }
        Body::InvokeMethod { object_id, method, args } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "method", method)?;
            write_args(enc, args)?;
        }
        Body::InvokeMethodRes { object_id, method, value, success } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "method", method)?;
            write_value(enc, "value", value)?;
            write_bool(enc, "success", *success)?;
        }
        Body::RequestConnection { object_id, event }
        | Body::ReleaseConnection { object_id, event } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "event", event)?;
        }
        Body::RequestConnectionRes { object_id, event, success }
        | Body::ReleaseConnectionRes { object_id, event, success } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "event", event)?;
            write_bool(enc, "success", *success)?;
        }
        Body::EventDelivery { object_id, event, args } => {
            write_i32(enc, "object", *object_id)?;
            write_str(enc, "event", event)?;
            write_args(enc, args)?;
        }
        Body::ReleaseObject { object_id } => write_i32(enc, "object", *object_id)?,
        Body::ReleaseObjectRes { object_id, success } => {
            write_i32(enc, "object", *object_id)?;
            write_bool(enc, "success", *success)?;
        }
        Body::ReleaseAccess => {}
        Body::ReleaseAccessRes { success } => write_bool(enc, "success", *success)?,
    }

    enc.variant_begin("ctx")?;
    enc.map_begin()?;
    for (key, value) in &msg.context {
        write_value(enc, key, value)?;
    }
    enc.map_end()?;
    enc.variant_end()?;

    enc.map_end()?;
    enc.variant_end()?;
    Ok(())
}

/// Fields collected from the envelope map before the body is assembled.
#[derive(Default)]
struct Fields {
    code: Option<u32>,
    id: Option<i32>,
    object: Option<i32>,
    app: Option<String>,
    name: Option<String>,
    method: Option<String>,
    event: Option<String>,
    granted: Option<bool>,
    success: Option<bool>,
    value: Option<Value>,
    args: Option<Vec<Value>>,
    names: Option<Vec<String>>,
    ctx: Option<Context>,
}

/// Decodes one payload (no frame header) into a message.
pub fn decode_payload(bytes: &[u8]) -> Result<Message> {
    let mut dec = Decoder::new(bytes);
    let (type_name, mut body) = dec.variant()?;
    if dec.remaining() != 0 {
        return Err(Error::ProtocolViolation("trailing bytes after message".into()));
    }

    let mut fields = Fields::default();
    let mut map = body.map()?;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "type" => fields.code = Some(val.u32()?),
            "id" => fields.id = Some(val.s32()?),
            "object" => fields.object = Some(val.s32()?),
            "app" => fields.app = Some(val.str()?.to_owned()),
            "name" => fields.name = Some(val.str()?.to_owned()),
            "method" => fields.method = Some(val.str()?.to_owned()),
            "event" => fields.event = Some(val.str()?.to_owned()),
            "granted" => fields.granted = Some(val.bool()?),
            "success" => fields.success = Some(val.bool()?),
            "value" => fields.value = Some(val.value()?),
            "args" => fields.args = Some(read_list(&mut val)?),
            "names" => {
                let mut names = Vec::new();
                let mut list = val.list()?;
                while let Some(mut item) = list.next()? {
                    names.push(item.str()?.to_owned());
                }
                fields.names = Some(names);
            }
            "ctx" => {
                let mut ctx = Context::new();
                let mut entries = val.map()?;
                while let Some((k, mut v)) = entries.next()? {
                    ctx.insert(k.to_owned(), v.value()?);
                }
                fields.ctx = Some(ctx);
            }
            _ => val.skip()?,
        }
    }

    let code = fields.code.ok_or(Error::MissingField("type"))?;
    let ty = MessageType::from_code(code).ok_or(Error::UnknownType(code))?;
    if ty.name() != type_name {
        return Err(Error::ProtocolViolation(format!(
            "variant '{}' carries type code of {}",
            type_name, ty
        )));
    }
    let id = fields.id.ok_or(Error::MissingField("id"))?;
    let context = fields.ctx.take().unwrap_or_default();
    let body = build_body(ty, fields)?;

    Ok(Message { id, body, context })
}

fn build_body(ty: MessageType, f: Fields) -> Result<Body> {
    let Fields { object, app, name, method, event, granted, success, value, args, names, .. } = f;
    let object = || required(object, "object");
    let success = || required(success, "success");

    let body = match ty {
        MessageType::RequestAccess => Body::RequestAccess { app_name: required(app, "app")? },
        MessageType::RequestAccessRes => Body::RequestAccessRes {
            granted: required(granted, "granted")?,
        },
        MessageType::RequestObject => Body::RequestObject { name: required(name, "name")? },
        MessageType::RequestObjectRes => Body::RequestObjectRes { object_id: object()? },
        MessageType::GetPropertyNames => Body::GetPropertyNames { object_id: object()? },
        MessageType::GetPropertyNamesRes => Body::GetPropertyNamesRes {
            object_id: object()?,
            names: required(names, "names")?,
        },
        MessageType::SetProperty => Body::SetProperty {
            object_id: object()?,
            name: required(name, "name")?,
            value: required(value, "value")?,
        },
        MessageType::SetPropertyRes => Body::SetPropertyRes {
            object_id: object()?,
            name: required(name, "name")?,
            value: required(value, "value")?,
            success: success()?,
        },
        MessageType::GetProperty => Body::GetProperty {
            object_id: object()?,
            name: required(name, "name")?,
        },
        MessageType::GetPropertyRes => Body::GetPropertyRes {
            object_id: object()?,
            name: required(name, "name")?,
            value: required(value, "value")?,
            success: success()?,
        },
        MessageType::InvokeMethod => Body::InvokeMethod {
            object_id: object()?,
            method: required(method, "method")?,
            args: required(args, "args")?,
        },
        MessageType::InvokeMethodRes => Body::InvokeMethodRes {
            object_id: object()?,
            method: required(method, "method")?,
            value: required(value, "value")?,
            success: success()?,
        },
        MessageType::RequestConnection => Body::RequestConnection {
            object_id: object()?,
            event: required(event, "event")?,
        },
        MessageType::RequestConnectionRes => Body::RequestConnectionRes {
            object_id: object()?,
            event: required(event, "event")?,
            success: success()?,
        },
        MessageType::EventDelivery => Body::EventDelivery {
            object_id: object()?,
            event: required(event, "event")?,
            args: required(args, "args")?,
        },
        MessageType::ReleaseObject => Body::ReleaseObject { object_id: object()? },
        MessageType::ReleaseObjectRes => Body::ReleaseObjectRes {
            object_id: object()?,
            success: success()?,
        },
        MessageType::ReleaseAccess => Body::ReleaseAccess,
        MessageType::ReleaseAccessRes => Body::ReleaseAccessRes { success: success()? },
        MessageType::ReleaseConnection => Body::ReleaseConnection {
            object_id: object()?,
            event: required(event, "event")?,
        },
        MessageType::ReleaseConnectionRes => Body::ReleaseConnectionRes {
            object_id: object()?,
            event: required(event, "event")?,
            success: success()?,
        },
    };
    Ok(body)
}

fn required<T>(field: Option<T>, name: &'static str) -> Result<T> {
    field.ok_or(Error::MissingField(name))
}

fn read_list(dec: &mut Decoder<'_>) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    let mut list = dec.list()?;
    while let Some(mut item) = list.next()? {
        items.push(item.value()?);
    }
    Ok(items)
}

// Helper functions

fn write_u32(enc: &mut Encoder, key: &str, val: u32) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u32(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_i32(enc: &mut Encoder, key: &str, val: i32) -> Result<()> {
    enc.variant_begin(key)?;
    enc.s32(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_bool(enc: &mut Encoder, key: &str, val: bool) -> Result<()> {
    enc.variant_begin(key)?;
    enc.bool(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_value(enc: &mut Encoder, key: &str, val: &Value) -> Result<()> {
    enc.variant_begin(key)?;
    enc.value(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_args(enc: &mut Encoder, args: &[Value]) -> Result<()> {
    enc.variant_begin("args")?;
    enc.list_begin()?;
    for arg in args {
        enc.value(arg)?;
    }
    enc.list_end()?;
    enc.variant_end()?;
    Ok(())
}
