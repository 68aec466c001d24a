use crate::*;
use std::collections::BTreeMap;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalars_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.bool(true)?;
    enc.bool(false)?;
    enc.null()?;
    enc.u32(u32::MAX)?;
    enc.s32(i32::MIN)?;
    enc.u64(u64::MAX)?;
    enc.s64(-42)?;
    enc.f64(2.5)?;
    enc.char('λ')?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.bool()?);
    assert!(!dec.bool()?);
    dec.null()?;
    assert_eq!(dec.u32()?, u32::MAX);
    assert_eq!(dec.s32()?, i32::MIN);
    assert_eq!(dec.u64()?, u64::MAX);
    assert_eq!(dec.s64()?, -42);
    assert_eq!(dec.f64()?, 2.5);
    assert_eq!(dec.char()?, 'λ');
    assert_eq!(dec.remaining(), 0);
    Ok(())
}

#[test]
fn test_blobs_are_zero_copy() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("hello")?;
    enc.bytes(&[1, 2, 3])?;
    let bytes = enc.into_bytes()?;

    let mut dec = Decoder::new(&bytes);
    let s = dec.str()?;
    assert_eq!(s, "hello");
    assert_eq!(s.as_ptr(), bytes[5..].as_ptr());
    assert_eq!(dec.bytes()?, &[1, 2, 3]);
    Ok(())
}

#[test]
fn test_wire_layout_is_little_endian() -> Result<()> {
    let mut enc = Encoder::new();
    enc.u32(0x0102_0304)?;
    enc.str("ab")?;
    let bytes = enc.into_bytes()?;
    assert_eq!(bytes, vec![0x05, 0x04, 0x03, 0x02, 0x01, 0x10, 2, 0, 0, 0, b'a', b'b']);
    Ok(())
}

// ============================================================================
//  CONTAINERS
// ============================================================================

#[test]
fn test_map_entries_and_skip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.variant_begin("a")?;
    enc.u32(1)?;
    enc.variant_end()?;
    enc.variant_begin("nested")?;
    enc.list_begin()?;
    enc.str("x")?;
    enc.list_begin()?;
    enc.list_end()?;
    enc.list_end()?;
    enc.variant_end()?;
    enc.variant_begin("b")?;
    enc.bool(true)?;
    enc.variant_end()?;
    enc.map_end()?;
    let bytes = enc.into_bytes()?;

    let mut dec = Decoder::new(&bytes);
    let mut map = dec.map()?;
    let mut seen = Vec::new();
    while let Some((key, mut val)) = map.next()? {
        match key {
            "a" => assert_eq!(val.u32()?, 1),
            "b" => assert!(val.bool()?),
            _ => val.skip()?,
        }
        seen.push(key);
    }
    assert_eq!(seen, vec!["a", "nested", "b"]);
    Ok(())
}

#[test]
fn test_value_roundtrip_nested() -> Result<()> {
    let mut inner = BTreeMap::new();
    inner.insert("k".to_string(), Value::from(vec![Value::Null, Value::from('c')]));
    inner.insert("bytes".to_string(), Value::Bytes(vec![0, 255]));
    let value = Value::List(vec![
        Value::from(2),
        Value::from("x"),
        Value::from(u64::MAX),
        Value::from(1.25),
        Value::Map(inner),
    ]);

    let mut enc = Encoder::new();
    enc.value(&value)?;
    let bytes = enc.into_bytes()?;
    assert_eq!(Decoder::new(&bytes).value()?, value);
    Ok(())
}

#[test]
fn test_narrow_integers_widen() -> Result<()> {
    let mut enc = Encoder::new();
    enc.s32(-7)?;
    enc.u32(7)?;
    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.value()?, Value::Int(-7));
    assert_eq!(dec.value()?, Value::UInt(7));
    Ok(())
}

// ============================================================================
//  ENCODER STATE MACHINE
// ============================================================================

#[test]
fn test_map_rejects_bare_items() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    assert_eq!(enc.u32(1), Err(Error::InvalidMapEntry));
    Ok(())
}

#[test]
fn test_variant_holds_exactly_one_item() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("v")?;
    assert_eq!(enc.variant_end(), Err(Error::EmptyVariant));

    let mut enc = Encoder::new();
    enc.variant_begin("v")?;
    enc.u32(1)?;
    assert_eq!(enc.u32(2), Err(Error::TooManyItems));
    Ok(())
}

#[test]
fn test_scope_errors() -> Result<()> {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end(), Err(Error::ScopeUnderflow));

    enc.list_begin()?;
    assert_eq!(
        enc.map_end(),
        Err(Error::ScopeMismatch { expected: Scope::Map, actual: Scope::List })
    );
    assert_eq!(enc.into_bytes(), Err(Error::ScopeStillOpen));
    Ok(())
}

// ============================================================================
//  DECODER ROBUSTNESS
// ============================================================================

#[test]
fn test_truncation_is_unexpected_end() -> Result<()> {
    let mut enc = Encoder::new();
    enc.value(&Value::List(vec![Value::from("abc"), Value::from(9)]))?;
    let bytes = enc.into_bytes()?;

    for cut in 0..bytes.len() {
        let result = Decoder::new(&bytes[..cut]).value();
        assert_eq!(result, Err(Error::UnexpectedEnd), "cut at {}", cut);
    }
    Ok(())
}

#[test]
fn test_invalid_tag() {
    let mut dec = Decoder::new(&[0xFF]);
    assert_eq!(dec.value(), Err(Error::InvalidTag(0xFF)));
}

#[test]
fn test_invalid_utf8() {
    let bytes = [0x10, 2, 0, 0, 0, 0xC3, 0x28];
    assert_eq!(Decoder::new(&bytes).str(), Err(Error::InvalidUtf8));
}

#[test]
fn test_wrong_tag_is_reported() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("nope")?;
    let bytes = enc.into_bytes()?;
    assert_eq!(
        Decoder::new(&bytes).u32(),
        Err(Error::UnexpectedTag { expected: Tag::U32, found: Tag::String })
    );
    Ok(())
}

#[test]
fn test_deep_nesting_is_rejected() -> Result<()> {
    let mut deep = Value::Null;
    for _ in 0..(MAX_DEPTH + 1) {
        deep = Value::List(vec![deep]);
    }
    assert_eq!(Encoder::new().value(&deep), Err(Error::RecursionLimitExceeded));

    let mut enc = Encoder::new();
    for _ in 0..(MAX_DEPTH + 1) {
        enc.list_begin()?;
    }
    enc.null()?;
    for _ in 0..(MAX_DEPTH + 1) {
        enc.list_end()?;
    }
    let bytes = enc.into_bytes()?;
    assert_eq!(Decoder::new(&bytes).value(), Err(Error::RecursionLimitExceeded));

    let mut shallow = Value::Null;
    for _ in 0..MAX_DEPTH {
        shallow = Value::List(vec![shallow]);
    }
    let mut enc = Encoder::new();
    enc.value(&shallow)?;
    let bytes = enc.into_bytes()?;
    assert_eq!(Decoder::new(&bytes).value()?, shallow);
    Ok(())
}

#[test]
fn test_value_accessors() {
    assert_eq!(Value::UInt(5).as_i64(), Some(5));
    assert_eq!(Value::Int(-1).as_u64(), None);
    assert_eq!(Value::from("s").as_str(), Some("s"));
    assert_eq!(Value::from(None::<i32>), Value::Null);
    assert_eq!(Value::from(vec![Value::from(1)]).to_string(), "[1]");
}
