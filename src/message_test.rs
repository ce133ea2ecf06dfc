use super::*;
use serde_json::json;

fn form(value: serde_json::Value) -> FormData {
    let serde_json::Value::Object(map) = value else {
        panic!("test data must be an object");
    };
    map
}

#[test]
fn update_sets_fields() {
    let msg = CrossTabMessage::update("quote", "tab-a", 3, form(json!({"name": "Alice"})), None);
    assert_eq!(msg.form_id, "quote");
    assert_eq!(msg.tab_id, "tab-a");
    assert_eq!(msg.kind(), MessageKind::Update);
    assert!(msg.timestamp > 0);
    assert!(matches!(msg.body, MessageBody::Update { version: Some(3), field_path: None, .. }));
}

#[test]
fn wire_shape_is_camel_case_with_type_tag() {
    let msg = CrossTabMessage::update("quote", "tab-a", 1, form(json!({"name": "A"})), Some("name".into()));
    let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

    assert_eq!(value["type"], "update");
    assert_eq!(value["formId"], "quote");
    assert_eq!(value["tabId"], "tab-a");
    assert_eq!(value["version"], 1);
    assert_eq!(value["fieldPath"], "name");
    assert_eq!(value["data"], json!({"name": "A"}));
}

#[test]
fn conflict_carries_both_sides() {
    let msg = CrossTabMessage::conflict("quote", "tab-a", form(json!({"v": "mine"})), form(json!({"v": "theirs"})));
    let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
    assert_eq!(value["type"], "conflict");
    assert_eq!(value["data"]["localData"], json!({"v": "mine"}));
    assert_eq!(value["data"]["remoteData"], json!({"v": "theirs"}));
}

#[test]
fn decode_accepts_each_kind() {
    let cases = [
        CrossTabMessage::update("f", "t", 1, form(json!({})), None),
        CrossTabMessage::clear("f", "t"),
        CrossTabMessage::restore_request("f", "t"),
        CrossTabMessage::conflict("f", "t", form(json!({})), form(json!({}))),
    ];
    for original in cases {
        let raw = original.encode().unwrap();
        let decoded = CrossTabMessage::decode("form-sync-f", "f", &raw).unwrap();
        assert_eq!(decoded, original, "kind {}", original.kind().as_str());
    }
}

#[test]
fn decode_accepts_update_without_version() {
    let raw = r#"{"type":"update","formId":"f","tabId":"t","timestamp":5,"data":{"a":1}}"#;
    let msg = CrossTabMessage::decode("form-sync-f", "f", raw).unwrap();
    assert!(matches!(msg.body, MessageBody::Update { version: None, .. }));
}

#[test]
fn decode_rejects_unknown_type() {
    let raw = r#"{"type":"explode","formId":"f","tabId":"t","timestamp":5}"#;
    assert!(matches!(
        CrossTabMessage::decode("form-sync-f", "f", raw),
        Err(MessageError::Malformed(_))
    ));
}

#[test]
fn decode_rejects_non_json() {
    assert!(matches!(
        CrossTabMessage::decode("form-sync-f", "f", "[object Object]"),
        Err(MessageError::Malformed(_))
    ));
}

#[test]
fn decode_rejects_update_with_non_object_data() {
    let raw = r#"{"type":"update","formId":"f","tabId":"t","timestamp":5,"version":1,"data":"nope"}"#;
    assert!(matches!(
        CrossTabMessage::decode("form-sync-f", "f", raw),
        Err(MessageError::Malformed(_))
    ));
}

#[test]
fn decode_rejects_missing_tab_id() {
    let raw = r#"{"type":"clear","formId":"f","tabId":"","timestamp":5}"#;
    assert_eq!(
        CrossTabMessage::decode("form-sync-f", "f", raw),
        Err(MessageError::MissingField("tabId"))
    );
}

#[test]
fn decode_rejects_record_for_other_form() {
    let raw = CrossTabMessage::clear("other", "t").encode().unwrap();
    assert!(matches!(
        CrossTabMessage::decode("form-sync-f", "f", &raw),
        Err(MessageError::FormMismatch { .. })
    ));
}

#[test]
fn decode_rejects_empty_field_path() {
    let raw = r#"{"type":"update","formId":"f","tabId":"t","timestamp":5,"version":1,"fieldPath":"","data":{}}"#;
    assert_eq!(
        CrossTabMessage::decode("form-sync-f", "f", raw),
        Err(MessageError::MissingField("fieldPath"))
    );
}
