use crate::*;

fn call_bytes(method: &str, seq: i32, payload: &[u8]) -> Vec<u8> {
    encode_call(method, SeqId(seq), payload).expect("encoding failed")
}

#[test]
fn test_call_roundtrip() {
    let bytes = call_bytes("orders.place", 7, b"\x01\x02\x03");
    let header = decode_header(&bytes).expect("decoding failed");

    assert_eq!(header.method, "orders.place");
    assert_eq!(header.kind, FrameKind::Call);
    assert_eq!(header.seq, SeqId(7));
    assert_eq!(header.payload, b"\x01\x02\x03");
}

#[test]
fn test_reply_and_exception_echo_header() {
    let reply = encode_reply("kv.get", SeqId(42), b"value").unwrap();
    let exception = encode_exception("kv.get", SeqId(42), b"boom").unwrap();

    let reply = decode_header(&reply).unwrap();
    let exception = decode_header(&exception).unwrap();

    assert_eq!(reply.kind, FrameKind::Reply);
    assert_eq!(exception.kind, FrameKind::Exception);
    assert_eq!((reply.method, reply.seq), (exception.method, exception.seq));
    assert_eq!(reply.payload, b"value");
    assert_eq!(exception.payload, b"boom");
}

#[test]
fn test_empty_payload_and_empty_method() {
    let bytes = call_bytes("", 0, &[]);
    let header = decode_header(&bytes).unwrap();

    assert_eq!(header.method, "");
    assert!(header.payload.is_empty());
    assert_eq!(bytes.len(), 12);
}

#[test]
fn test_unicode_method_name() {
    let bytes = call_bytes("größe.berechnen", i32::MAX, b"x");
    let header = decode_header(&bytes).unwrap();

    assert_eq!(header.method, "größe.berechnen");
    assert_eq!(header.seq, SeqId(i32::MAX));
}

#[test]
fn test_exact_wire_layout() {
    let bytes = call_bytes("ping", 258, b"!");

    let expected: Vec<u8> = vec![
        0x80, 0x01, 0x00, 0x01, // version | CALL
        0x00, 0x00, 0x00, 0x04, // name length
        b'p', b'i', b'n', b'g', // name
        0x00, 0x00, 0x01, 0x02, // seq id
        b'!',                   // payload
    ];
    assert_eq!(bytes, expected);
}

#[test]
fn test_encoded_len_matches_output() {
    let enc = FrameEncoder::exception("audit.append", SeqId(3), b"some payload");
    let bytes = enc.to_bytes().unwrap();
    assert_eq!(enc.encoded_len(), bytes.len());
}

#[test]
fn test_encode_appends_to_existing_buffer() {
    let mut out = vec![0xAA];
    FrameEncoder::reply("m", SeqId(1), b"p").encode(&mut out).unwrap();

    assert_eq!(out[0], 0xAA);
    let header = decode_header(&out[1..]).unwrap();
    assert_eq!(header.method, "m");
}

#[test]
fn test_truncated_frames_are_rejected() {
    let bytes = call_bytes("inventory.reserve", 9, &[]);

    // Every strict prefix that cuts into the header must fail cleanly.
    for cut in 0..bytes.len() {
        match decode_header(&bytes[..cut]) {
            Err(Error::UnexpectedEnd { .. }) => {}
            other => panic!("prefix of {} bytes: expected UnexpectedEnd, got {:?}", cut, other),
        }
    }
}

#[test]
fn test_bad_version_rejected() {
    let mut bytes = call_bytes("m", 1, &[]);
    bytes[0] = 0x00;

    match decode_header(&bytes) {
        Err(Error::BadVersion(word)) => assert_eq!(word, 0x0001_0001),
        other => panic!("Expected BadVersion, got {:?}", other),
    }
}

#[test]
fn test_oneway_kind_is_unknown() {
    let mut bytes = call_bytes("m", 1, &[]);
    bytes[3] = 4;

    assert_eq!(decode_header(&bytes).unwrap_err(), Error::UnknownKind(4));
}

#[test]
fn test_negative_method_length_rejected() {
    let mut bytes = call_bytes("m", 1, &[]);
    bytes[4..8].copy_from_slice(&(-1i32).to_be_bytes());

    assert_eq!(decode_header(&bytes).unwrap_err(), Error::InvalidMethodLength(-1));
}

#[test]
fn test_oversized_method_length_rejected() {
    let mut bytes = call_bytes("m", 1, &[]);
    bytes[4..8].copy_from_slice(&(MAX_METHOD_LEN as i32 + 1).to_be_bytes());

    assert!(matches!(decode_header(&bytes), Err(Error::InvalidMethodLength(_))));
}

#[test]
fn test_invalid_utf8_method_rejected() {
    let mut bytes = call_bytes("ab", 1, &[]);
    bytes[8] = 0xFF;

    assert_eq!(decode_header(&bytes).unwrap_err(), Error::InvalidUtf8);
}

#[test]
fn test_method_too_long_on_encode() {
    let long = "x".repeat(MAX_METHOD_LEN + 1);
    let err = encode_call(&long, SeqId(1), &[]).unwrap_err();
    assert_eq!(err, Error::MethodTooLong(MAX_METHOD_LEN + 1));
}

#[test]
fn test_check_method_boundary() {
    assert!(check_method(&"x".repeat(MAX_METHOD_LEN)).is_ok());
    assert_eq!(
        check_method(&"x".repeat(MAX_METHOD_LEN + 1)),
        Err(Error::MethodTooLong(MAX_METHOD_LEN + 1))
    );
}

#[test]
fn test_peek_seq_ignores_method_encoding() {
    let mut bytes = encode_reply("ab", SeqId(-5), b"tail").unwrap();
    bytes[8] = 0xFF;

    let (kind, seq) = peek_seq(&bytes).unwrap();
    assert_eq!(kind, FrameKind::Reply);
    assert_eq!(seq, SeqId(-5));
    assert!(decode_header(&bytes).is_err());
}

#[test]
fn test_owned_frame_roundtrip() {
    let frame = CallFrame {
        method: "billing.charge".into(),
        kind: FrameKind::Exception,
        seq: SeqId(1234),
        payload: vec![0, 1, 2, 3],
    };

    let bytes = frame.encode().unwrap();
    assert_eq!(CallFrame::decode(&bytes).unwrap(), frame);
}

#[test]
fn test_kind_codes() {
    for kind in [FrameKind::Call, FrameKind::Reply, FrameKind::Exception] {
        assert_eq!(FrameKind::from_code(kind.as_code()).unwrap(), kind);
    }
    assert!(!FrameKind::Call.is_response());
    assert!(FrameKind::Reply.is_response());
    assert!(FrameKind::Exception.is_response());
    assert_eq!(FrameKind::from_code(0).unwrap_err(), Error::UnknownKind(0));
}
