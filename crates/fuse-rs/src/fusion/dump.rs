use serde_json::{json, Value};

use crate::fusion::Partition;

/// Compact JSON description of a partitioning, for logs and debugging.
pub fn dump_partitions(partitions: &[Partition]) -> Value {
    let entries: Vec<Value> = partitions
        .iter()
        .map(|partition| {
            json!({
                "id": partition.id().0,
                "supported": partition.is_supported(),
                "backend": partition.backend(),
                "pattern": partition.pattern_name(),
                "fused_kind": partition.fused_kind(),
                "ops": partition
                    .ops()
                    .iter()
                    .map(|op| json!({ "id": op.id.0, "kind": op.kind.as_str() }))
                    .collect::<Vec<_>>(),
                "inputs": partition.inputs().iter().map(|t| t.id.0).collect::<Vec<_>>(),
                "outputs": partition.outputs().iter().map(|t| t.id.0).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "partitions": entries })
}
