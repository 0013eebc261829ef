use petrel_wire::{decode_frame_body, encode_frame, FrameHeader};
use std::fs;

#[test]
fn vectors_match_frame_encoding() {
    let dir = "tests/vectors";
    let mut seen = 0;
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let entry = entry.expect("entry");
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        seen += 1;
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");
        let frame_hex = value["frame_hex"].as_str().expect("frame_hex");
        let stream_id = value["stream_id"].as_u64().expect("stream_id");
        let frame = hex_to_bytes(frame_hex);

        // The frame must parse: header, then exactly `size` body bytes.
        let header = FrameHeader::decode(&frame).expect("header");
        let body = bytes::Bytes::copy_from_slice(&frame[FrameHeader::LEN..]);
        assert_eq!(body.len(), header.size as usize, "size mismatch for {path:?}");
        let (decoded_stream, message) = decode_frame_body(body).expect("decode");
        assert_eq!(decoded_stream, stream_id, "stream id mismatch for {path:?}");

        // Re-encoding must reproduce the bytes exactly.
        let encoded = encode_frame(stream_id, &message).expect("encode");
        assert_eq!(
            encoded.as_ref(),
            frame.as_slice(),
            "round trip mismatch for {path:?}"
        );
    }
    assert!(seen >= 3, "expected at least three vectors, found {seen}");
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
