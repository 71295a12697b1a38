use std::fs;
use std::path::Path;

use serde_json::Value;

#[test]
fn capabilities_allow_dialog_open() {
    let crate_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let capabilities_path = crate_root.join("capabilities").join("default.json");
    let capabilities_raw =
        fs::read_to_string(&capabilities_path).expect("failed to read capabilities/default.json");
    let capabilities: Value = serde_json::from_str(&capabilities_raw)
        .expect("capabilities/default.json must be valid JSON");

    let permissions = capabilities
        .get("permissions")
        .and_then(|v| v.as_array())
        .expect("capabilities/default.json permissions must be an array");

    assert!(
        permissions.iter().any(|entry| entry.as_str() == Some("dialog:allow-open")),
        "capabilities/default.json must include dialog:allow-open so the audio/image/folder pickers work"
    );
}
