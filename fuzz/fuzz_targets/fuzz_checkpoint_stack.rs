//! Fuzz target for checkpoint stacking.
//!
//! Checkpoints are opaque JSON from the master. Stacking any pair must
//! not panic, and a null page checkpoint keeps the stored one.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_protocol::Checkpoint;

fuzz_target!(|data: (&str, &str)| {
    let (previous, next) = data;
    let parse = |s: &str| serde_json::from_str::<serde_json::Value>(s).ok().map(Checkpoint::new);

    let previous = parse(previous);
    let next = parse(next);

    let _ = Checkpoint::stack(previous.as_ref(), next);
    assert_eq!(
        Checkpoint::stack(previous.as_ref(), Some(Checkpoint::new(serde_json::Value::Null))),
        previous
    );
});
