//! Fuzz target for wire document decoding.
//!
//! Master responses are untrusted. `Document::from_wire` must reject
//! malformed JSON objects with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_protocol::{Document, DocumentSchema};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let schema = DocumentSchema::default();
    if let Ok(doc) = Document::from_wire(value, &schema) {
        // Accepted documents re-encode with their key
        let wire = doc.to_wire(&schema);
        assert_eq!(wire.get("id").and_then(|v| v.as_str()), Some(doc.id.as_str()));
    }
});
