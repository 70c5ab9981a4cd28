//! Object-statistics pass (§4.I): a one-shot type-counter and memory
//! aggregation over a list of live objects.
//!
//! Grounded on `count::stat::Stat`'s shape: a single pass over whatever
//! fields the caller asked for (there, `read_format` bits; here,
//! `include_memory`), collected into one flat result with no sorting or
//! filtering.

use crate::host::InspectedObject;
use std::collections::HashMap;

/// Result of one [`collect`] pass.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectStats {
    pub type_counter: HashMap<String, u64>,
    pub type_memory: Option<HashMap<String, u64>>,
    pub total_objects: u64,
    pub total_memory: Option<u64>,
}

/// Single-pass aggregation over `objects` (§4.I). When `include_memory` is
/// false, no per-object size is queried and `type_memory`/`total_memory`
/// are `None` rather than zeroed maps.
pub fn collect(objects: &[Box<dyn InspectedObject>], include_memory: bool) -> ObjectStats {
    let mut type_counter: HashMap<String, u64> = HashMap::new();
    let mut type_memory: Option<HashMap<String, u64>> = include_memory.then(HashMap::new);
    let mut total_memory: Option<u64> = include_memory.then_some(0);

    for obj in objects {
        let name = obj.type_name();
        *type_counter.entry(name.to_string()).or_insert(0) += 1;

        if include_memory {
            let size = obj.size_bytes();
            *type_memory
                .as_mut()
                .expect("type_memory is Some when include_memory is true")
                .entry(name.to_string())
                .or_insert(0) += size;
            *total_memory
                .as_mut()
                .expect("total_memory is Some when include_memory is true") += size;
        }
    }

    ObjectStats {
        total_objects: objects.len() as u64,
        type_counter,
        type_memory,
        total_memory,
    }
}
