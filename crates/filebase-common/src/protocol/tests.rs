use super::*;
use serde_json::json;

#[test]
fn test_call_frame_serialization() {
    let msg = ChannelMessage::call("echo", vec![json!({"a": 1})], "abc123DEF456");
    let text = msg.encode().unwrap();
    assert!(text.contains(r#""name":"echo""#));
    assert!(text.contains(r#""rid":"abc123DEF456""#));
    assert!(text.contains(r#""args":[{"a":1}]"#));
}

#[test]
fn test_response_frame_has_rid_as_name() {
    let msg = ChannelMessage::response("abc123DEF456", json!(42));
    assert_eq!(msg.name, "abc123DEF456");
    assert_eq!(msg.args, vec![json!(42)]);
    assert!(msg.rid.is_none());

    // rid must not appear on the wire at all for responses
    let text = msg.encode().unwrap();
    assert!(!text.contains("rid"));
}

#[test]
fn test_error_frame() {
    let msg = ChannelMessage::error(json!({"message": "boom"}));
    assert!(msg.is_error());
    assert_eq!(msg.name, ERROR_FRAME_NAME);
}

#[test]
fn test_decode_roundtrip() {
    let text = r#"{"name":"echo","args":[1,"two"],"rid":"r1"}"#;
    let msg = ChannelMessage::decode(text).unwrap();
    assert_eq!(msg.name, "echo");
    assert_eq!(msg.args, vec![json!(1), json!("two")]);
    assert_eq!(msg.rid.as_deref(), Some("r1"));
}

#[test]
fn test_decode_defaults_missing_args() {
    let msg = ChannelMessage::decode(r#"{"name":"ping"}"#).unwrap();
    assert_eq!(msg.name, "ping");
    assert!(msg.args.is_empty());
    assert!(msg.rid.is_none());
}

#[test]
fn test_decode_rejects_malformed_frame() {
    let err = ChannelMessage::decode(r#"{"name":"#).unwrap_err();
    assert!(matches!(err, FilebaseError::ChannelProtocol(_)));
}

#[test]
fn test_decode_rejects_empty_name() {
    let err = ChannelMessage::decode(r#"{"name":"","args":[]}"#).unwrap_err();
    assert!(matches!(err, FilebaseError::ChannelProtocol(_)));
}

#[test]
fn test_correlation_id_shape() {
    let a = correlation_id();
    let b = correlation_id();
    assert_eq!(a.len(), CORRELATION_ID_LEN);
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    // Two draws colliding would mean the generator is broken
    assert_ne!(a, b);
}

#[test]
fn test_error_display_carries_context() {
    let err = FilebaseError::module_load("/srv/index.code.js", "unexpected token");
    let text = err.to_string();
    assert!(text.contains("/srv/index.code.js"));
    assert!(text.contains("unexpected token"));

    let err = FilebaseError::CallTimeout(1500);
    assert!(err.to_string().contains("1500ms"));
}
