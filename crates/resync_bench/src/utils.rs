//! Benchmark utilities.

use rand::Rng;
use resync_protocol::{OperationPriority, Record, SyncOperation};
use serde_json::{json, Value};

/// Pick a random priority.
pub fn random_priority() -> OperationPriority {
    let mut rng = rand::thread_rng();
    OperationPriority::ALL[rng.gen_range(0..OperationPriority::ALL.len())]
}

/// Generate a batch of update operations with random priorities.
pub fn generate_operations(count: usize) -> Vec<SyncOperation> {
    (0..count)
        .map(|i| {
            let mut payload = Record::new();
            payload.insert("id".into(), Value::String(format!("e{i}")));
            SyncOperation::update("bench", payload)
                .with_id(format!("op-{i}"))
                .with_priority(random_priority())
        })
        .collect()
}

/// Generate an entity snapshot with `width` fields of mixed kinds.
pub fn random_record(width: usize) -> Record {
    let mut rng = rand::thread_rng();
    let mut record = Record::new();
    for i in 0..width {
        let value = match i % 5 {
            0 => json!(rng.gen_range(0..1000)),
            1 => json!(rng.gen_bool(0.5)),
            2 => json!(format!("text {}", rng.gen::<u32>())),
            3 => json!([rng.gen_range(0..10), rng.gen_range(0..10)]),
            _ => json!({"nested": rng.gen::<u16>()}),
        };
        record.insert(format!("field_{i}"), value);
    }
    record
}

/// Generate a snapshot and a copy with every `stride`-th field changed.
pub fn diverged_pair(width: usize, stride: usize) -> (Record, Record) {
    let local = random_record(width);
    let mut remote = local.clone();
    for (i, (_, value)) in remote.iter_mut().enumerate() {
        if stride > 0 && i % stride == 0 {
            *value = json!(format!("changed {i}"));
        }
    }
    (local, remote)
}
