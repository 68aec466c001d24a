//! Reassembly of framed messages from a byte stream split at arbitrary points.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use remowire::Body;
use remowire::FrameBuffer;
use remowire::FrameLimits;
use remowire::Message;
use remowire::MessageType;
use remowire::Value;
use remowire::encode;

/// One message of every type, with non-trivial field contents.
fn every_message() -> Vec<Message> {
    let bodies = vec![
        Body::RequestAccess { app_name: "Workbench".into() },
        Body::RequestAccessRes { granted: true },
        Body::RequestObject { name: "Comp.Widget".into() },
        Body::RequestObjectRes { object_id: -1 },
        Body::GetPropertyNames { object_id: 1 },
        Body::GetPropertyNamesRes { object_id: 1, names: vec!["title".into(), "count".into()] },
        Body::SetProperty { object_id: 1, name: "title".into(), value: Value::from("hello") },
        Body::SetPropertyRes { object_id: 1, name: "title".into(), value: Value::from("old"), success: false },
        Body::GetProperty { object_id: 2, name: "count".into() },
        Body::GetPropertyRes { object_id: 2, name: "count".into(), value: Value::from(41u64), success: true },
        Body::InvokeMethod {
            object_id: 3,
            method: "add".into(),
            args: vec![Value::from(2), Value::from("x"), Value::List(vec![Value::Null, Value::from(1.5)])],
        },
        Body::InvokeMethodRes { object_id: 3, method: "add".into(), value: Value::Null, success: false },
        Body::RequestConnection { object_id: 4, event: "changed".into() },
        Body::RequestConnectionRes { object_id: 4, event: "changed".into(), success: true },
        Body::EventDelivery { object_id: 4, event: "changed".into(), args: vec![Value::from('z')] },
        Body::ReleaseObject { object_id: 5 },
        Body::ReleaseObjectRes { object_id: 5, success: true },
        Body::ReleaseAccess,
        Body::ReleaseAccessRes { success: true },
        Body::ReleaseConnection { object_id: 4, event: "changed".into() },
        Body::ReleaseConnectionRes { object_id: 4, event: "changed".into(), success: false },
    ];

    let messages: Vec<Message> = bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| Message::new(i as i32 + 1, body).with_context("seq", i as u64))
        .collect();

    let covered: Vec<MessageType> = messages.iter().map(|m| m.message_type()).collect();
    assert_eq!(covered, MessageType::ALL.to_vec(), "every type is exercised once");
    messages
}

fn drain(buf: &mut FrameBuffer, out: &mut Vec<Message>) -> anyhow::Result<()> {
    while let Some(msg) = buf.next_message()? {
        out.push(msg);
    }
    Ok(())
}

#[test]
fn test_each_type_split_at_every_boundary() -> anyhow::Result<()> {
    for msg in every_message() {
        let frame = encode(&msg)?;
        for split in 0..=frame.len() {
            let mut buf = FrameBuffer::new(FrameLimits::default());
            let mut out = Vec::new();

            buf.extend(&frame[..split])?;
            drain(&mut buf, &mut out)?;
            if split < frame.len() {
                assert!(out.is_empty(), "{} decoded early at split {}", msg.message_type(), split);
            }

            buf.extend(&frame[split..])?;
            drain(&mut buf, &mut out)?;
            assert_eq!(out, vec![msg.clone()], "split at {}", split);
            assert_eq!(buf.buffered(), 0);
        }
    }
    Ok(())
}

#[test]
fn test_concatenated_messages_in_one_chunk() -> anyhow::Result<()> {
    let messages = every_message();
    let mut stream = Vec::new();
    for msg in &messages {
        stream.extend(encode(msg)?);
    }

    let mut buf = FrameBuffer::new(FrameLimits::default());
    let mut out = Vec::new();
    buf.extend(&stream)?;
    drain(&mut buf, &mut out)?;
    assert_eq!(out, messages);
    Ok(())
}

#[test]
fn test_random_chunking_preserves_order() -> anyhow::Result<()> {
    let messages = every_message();
    let mut stream = Vec::new();
    for msg in &messages {
        stream.extend(encode(msg)?);
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let mut buf = FrameBuffer::new(FrameLimits::default());
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let take = rng.gen_range(1..=64).min(stream.len() - pos);
            buf.extend(&stream[pos..pos + take])?;
            drain(&mut buf, &mut out)?;
            pos += take;
        }
        assert_eq!(out, messages);
    }
    Ok(())
}

#[test]
fn test_one_byte_at_a_time() -> anyhow::Result<()> {
    let messages = every_message();
    let mut buf = FrameBuffer::new(FrameLimits::default());
    let mut out = Vec::new();
    for msg in &messages {
        for byte in encode(msg)? {
            buf.extend(&[byte])?;
            drain(&mut buf, &mut out)?;
        }
    }
    assert_eq!(out, messages);
    Ok(())
}
