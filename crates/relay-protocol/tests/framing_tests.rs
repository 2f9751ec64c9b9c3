use relay_protocol::*;

fn sample_send() -> Envelope {
    Envelope::send(
        "bob",
        &SendPayload {
            kind: PayloadKind::Message,
            body: "review PR #12".into(),
            data: Some(serde_json::json!({ "pr": 12 })),
            thread: Some("thread-1".into()),
        },
    )
    .unwrap()
    .from("alice")
    .with_topic("reviews")
    .with_meta(PayloadMeta {
        importance: Some(90),
        correlation_id: Some("corr-1".into()),
        ..Default::default()
    })
}

#[test]
fn test_round_trip_current_mode() {
    let env = sample_send();
    let frame = encode(&env).unwrap();
    let mut parser = FrameParser::new(FrameMode::Current);
    let decoded = parser.push(&frame).unwrap();
    assert_eq!(decoded, vec![env]);
}

#[test]
fn test_round_trip_legacy_mode() {
    let env = Envelope::new(MessageType::Hello, serde_json::json!({ "agent": "alice" }));
    let frame = encode_with_mode(&env, FrameMode::Legacy).unwrap();
    let mut parser = FrameParser::new(FrameMode::Legacy);
    assert_eq!(parser.push(&frame).unwrap(), vec![env]);
}

#[test]
fn test_oversized_body_fails_before_output() {
    let big = "x".repeat(MAX_FRAME_BYTES + 1);
    let env = Envelope::send("bob", &SendPayload::text(big)).unwrap();
    match encode(&env) {
        Err(ProtocolError::FrameTooLarge { size, max }) => {
            assert!(size > max);
            assert_eq!(max, MAX_FRAME_BYTES);
        }
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[test]
fn test_two_chunk_push() {
    let env = sample_send();
    let frame = encode(&env).unwrap();
    let mut parser = FrameParser::new(FrameMode::Current);

    let first = parser.push(&frame[..5]).unwrap();
    assert!(first.is_empty(), "header alone must not yield an envelope");
    assert_eq!(parser.buffered(), 5);

    let second = parser.push(&frame[5..]).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0], env);
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn test_multiple_frames_in_one_chunk_with_partial_tail() {
    let a = Envelope::new(MessageType::Ping, serde_json::Value::Null);
    let b = Envelope::new(MessageType::Pong, serde_json::Value::Null);
    let c = sample_send();

    let mut bytes = encode(&a).unwrap();
    bytes.extend(encode(&b).unwrap());
    let c_frame = encode(&c).unwrap();
    bytes.extend_from_slice(&c_frame[..7]);

    let mut parser = FrameParser::default();
    let out = parser.push(&bytes).unwrap();
    assert_eq!(out, vec![a, b]);

    let out = parser.push(&c_frame[7..]).unwrap();
    assert_eq!(out, vec![c]);
}

#[test]
fn test_malformed_body_is_fatal() {
    let body = b"{not json";
    let mut frame = vec![FORMAT_JSON];
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    let mut parser = FrameParser::new(FrameMode::Current);
    assert!(matches!(
        parser.push(&frame),
        Err(ProtocolError::MalformedEnvelope(_))
    ));
}
