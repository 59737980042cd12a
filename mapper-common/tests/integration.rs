//! Integration tests for mapper-common library.

use mapper_common::{
    DeviceTopics, DeviceTwinDelta, DeviceTwinUpdate, decode, encode, parse_delta_topic,
};

#[test]
fn test_delta_round_trip_through_topic_and_payload() {
    // The cloud side publishes a delta for a device
    let topics = DeviceTopics::new("pump1");
    let delta = DeviceTwinDelta::from_pairs([("speed", "42"), ("mode", "auto")]);
    let payload = encode(&delta).expect("encode failed");

    // The mapper resolves the device from the topic and decodes the payload
    let delta_topic = topics.twin_delta();
    let device = parse_delta_topic(&delta_topic).expect("not a delta topic");
    assert_eq!(device, "pump1");

    let decoded: DeviceTwinDelta = decode(&payload).expect("decode failed");
    assert_eq!(decoded.delta.len(), 2);
    assert_eq!(decoded.delta["speed"], "42");
    assert_eq!(decoded.delta["mode"], "auto");
}

#[test]
fn test_twin_update_is_decodable_by_consumers() {
    let update = DeviceTwinUpdate::actual("speed", "int", "42".to_string());
    let payload = encode(&update).expect("encode failed");

    let decoded: DeviceTwinUpdate = decode(&payload).expect("decode failed");
    let twin = &decoded.twin["speed"];
    assert_eq!(
        twin.actual.as_ref().and_then(|v| v.value.as_deref()),
        Some("42")
    );
    assert_eq!(twin.metadata.as_ref().unwrap().value_type, "int");
}

#[test]
fn test_garbage_payload_is_rejected() {
    let result: mapper_common::Result<DeviceTwinDelta> = decode(b"not json");
    assert!(result.is_err());
}
