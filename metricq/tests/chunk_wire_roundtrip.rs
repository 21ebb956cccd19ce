//! End-to-end delta-chunk encode/decode through the actual protobuf wire
//! bytes, rather than the in-process `WireDataChunk` structs `chunk.rs`'s own
//! unit tests exercise.

use metricq::chunk::DataChunk;
use metricq::time::{TimeValue, Timestamp};

fn tv(ns: i64, v: f64) -> TimeValue {
    TimeValue::new(Timestamp::from_ns(ns), v)
}

#[test]
fn survives_a_full_encode_decode_through_bytes() {
    let samples = vec![
        tv(1_000_000_000, 1.0),
        tv(1_001_000_000, 2.5),
        tv(1_002_500_000, -3.25),
        tv(1_002_500_000, 0.0), // repeated timestamp, zero delta
    ];

    let bytes = DataChunk::encode_to_vec(&samples, 0);
    let decoded = DataChunk::decode_from_slice(&bytes).unwrap();

    assert_eq!(decoded.samples(), samples.as_slice());
}

#[test]
fn a_chunk_continuing_a_prior_one_only_needs_its_own_bytes() {
    // Two chunks from the same metric timeline, the second continuing from
    // the last absolute timestamp of the first, each encoded independently
    // (as they would be published in two separate `DataChunk` messages).
    let first = vec![tv(1_000, 1.0), tv(2_000, 2.0)];
    let second = vec![tv(2_500, 3.0), tv(5_000, 4.0)];

    let first_bytes = DataChunk::encode_to_vec(&first, 0);
    let second_bytes = DataChunk::encode_to_vec(&second, 2_000);

    let decoded_first = DataChunk::decode_from_slice(&first_bytes).unwrap();
    let decoded_second = DataChunk::decode_from_slice(&second_bytes).unwrap();

    assert_eq!(decoded_first.samples(), first.as_slice());
    assert_eq!(decoded_second.samples(), second.as_slice());
}

#[test]
fn decoding_a_zero_field_number_tag_is_a_malformed_chunk_error() {
    // A leading tag byte of 0x00 decodes to field number 0, which prost
    // rejects outright regardless of what (if anything) follows.
    let err = DataChunk::decode_from_slice(&[0x00]).unwrap_err();
    assert!(matches!(err, metricq::error::AgentError::MalformedChunk(_)));
}
