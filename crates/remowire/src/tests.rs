use remopack::Encoder;

use crate::*;

fn invoke() -> Message {
    Message::new(7, Body::InvokeMethod {
        object_id: 3,
        method: "add".into(),
        args: vec![Value::from(2), Value::from("x")],
    })
    .with_context("proxy", "Comp.Widget")
}

// ============================================================================
//  TYPE CODES
// ============================================================================

#[test]
fn test_direction_follows_code_bits() {
    use MessageType::*;

    for ty in [RequestAccess, RequestObject, GetPropertyNames, SetProperty, GetProperty, InvokeMethod, RequestConnection] {
        assert_eq!(ty.direction(), Direction::ClientToServer, "{}", ty);
    }
    for ty in [
        RequestAccessRes, RequestObjectRes, GetPropertyNamesRes, SetPropertyRes, GetPropertyRes,
        InvokeMethodRes, RequestConnectionRes, ReleaseObjectRes, ReleaseAccessRes, ReleaseConnectionRes,
    ] {
        assert_eq!(ty.direction(), Direction::ServerToClient, "{}", ty);
    }
    for ty in [EventDelivery, ReleaseObject, ReleaseAccess, ReleaseConnection] {
        assert_eq!(ty.direction(), Direction::Both, "{}", ty);
    }
}

#[test]
fn test_sendable_by_role() {
    assert!(MessageType::InvokeMethod.sendable_by(Role::Client));
    assert!(!MessageType::InvokeMethod.sendable_by(Role::Server));
    assert!(MessageType::InvokeMethodRes.sendable_by(Role::Server));
    assert!(!MessageType::InvokeMethodRes.sendable_by(Role::Client));
    assert!(MessageType::ReleaseObject.sendable_by(Role::Server));
    assert!(MessageType::ReleaseObject.sendable_by(Role::Client));
}

#[test]
fn test_codes_are_unique_and_resolvable() {
    for ty in MessageType::ALL {
        assert_eq!(MessageType::from_code(ty.code()), Some(ty));
    }
    assert_eq!(MessageType::from_code(0x0fff), Some(MessageType::EventDelivery));
    assert_eq!(MessageType::from_code(0x1234), None);
}

// ============================================================================
//  PAYLOAD CODEC
// ============================================================================

#[test]
fn test_payload_roundtrip_keeps_context() -> Result<()> {
    let msg = invoke();
    let decoded = decode_payload(&encode_payload(&msg)?)?;
    assert_eq!(decoded, msg);
    assert_eq!(decoded.context.get("proxy"), Some(&Value::from("Comp.Widget")));
    assert_eq!(decoded.object_id(), Some(3));
    Ok(())
}

#[test]
fn test_unknown_fields_are_skipped() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("ReleaseObject")?;
    enc.map_begin()?;
    enc.variant_begin("future")?;
    enc.list_begin()?;
    enc.str("ignored")?;
    enc.list_end()?;
    enc.variant_end()?;
    enc.variant_begin("type")?;
    enc.u32(0x1000)?;
    enc.variant_end()?;
    enc.variant_begin("id")?;
    enc.s32(4)?;
    enc.variant_end()?;
    enc.variant_begin("object")?;
    enc.s32(9)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    let msg = decode_payload(&bytes)?;
    assert_eq!(msg, Message::new(4, Body::ReleaseObject { object_id: 9 }));
    Ok(())
}

#[test]
fn test_missing_field_is_reported() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("GetProperty")?;
    enc.map_begin()?;
    enc.variant_begin("type")?;
    enc.u32(0x00f9)?;
    enc.variant_end()?;
    enc.variant_begin("id")?;
    enc.s32(1)?;
    enc.variant_end()?;
    enc.variant_begin("object")?;
    enc.s32(1)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    assert_eq!(decode_payload(&bytes), Err(Error::MissingField("name")));
    Ok(())
}

#[test]
fn test_name_and_code_must_agree() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("ReleaseAccess")?;
    enc.map_begin()?;
    enc.variant_begin("type")?;
    enc.u32(0x00f1)?;
    enc.variant_end()?;
    enc.variant_begin("id")?;
    enc.s32(1)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    assert!(matches!(decode_payload(&bytes), Err(Error::ProtocolViolation(_))));
    Ok(())
}

#[test]
fn test_unknown_type_code() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("Mystery")?;
    enc.map_begin()?;
    enc.variant_begin("type")?;
    enc.u32(0x0abc)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    assert_eq!(decode_payload(&bytes), Err(Error::UnknownType(0x0abc)));
    Ok(())
}

// ============================================================================
//  FRAMING
// ============================================================================

#[test]
fn test_frame_header_layout() -> Result<()> {
    let frame = encode(&invoke())?;
    assert_eq!(&frame[..2], b"RO");
    let len = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
    assert_eq!(len + HEADER_LEN, frame.len());
    Ok(())
}

#[test]
fn test_decode_reports_consumed() -> Result<()> {
    let mut bytes = encode(&invoke())?;
    let first_len = bytes.len();
    bytes.extend(encode(&Message::new(8, Body::ReleaseAccess))?);

    match decode(&bytes, &FrameLimits::default()) {
        Ok(Decoded::Message { message, consumed }) => {
            assert_eq!(message, invoke());
            assert_eq!(consumed, first_len);
        }
        other => panic!("expected a message, got {:?}", other),
    }
    assert_eq!(decode(&bytes[..first_len - 1], &FrameLimits::default()), Ok(Decoded::Incomplete));
    Ok(())
}

#[test]
fn test_bad_magic_is_detected_early() {
    let limits = FrameLimits::default();
    assert_eq!(decode(b"X", &limits), Err(FrameError::BadMagic([b'X', 0])));
    assert_eq!(decode(b"RX\0\0", &limits), Err(FrameError::BadMagic(*b"RX")));
    assert_eq!(decode(b"R", &limits), Ok(Decoded::Incomplete));
}

#[test]
fn test_oversize_frame_is_rejected_before_body() {
    let limits = FrameLimits::default().with_max_frame_len(16);
    let header = [b'R', b'O', 17, 0, 0, 0];
    assert_eq!(decode(&header, &limits), Err(FrameError::FrameTooLarge { len: 17, max: 16 }));
}

#[test]
fn test_buffer_overflow() {
    let mut buf = FrameBuffer::new(FrameLimits::default().with_max_buffered(8));
    assert!(buf.extend(b"RO\x00").is_ok());
    assert_eq!(
        buf.extend(&[0u8; 6]),
        Err(FrameError::BufferOverflow { buffered: 9, max: 8 })
    );
}

#[test]
fn test_corrupt_payload() {
    let mut buf = FrameBuffer::new(FrameLimits::default());
    assert!(buf.extend(&[b'R', b'O', 1, 0, 0, 0, 0xFF]).is_ok());
    assert!(matches!(buf.next_message(), Err(FrameError::Corrupt(_))));
}

#[test]
fn test_transcript_line() {
    assert_eq!(invoke().to_string(), "InvokeMethod[7] object=3 add(2, \"x\")");
}
