use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Key under which a directory's rows are stored in a shared backing store.
pub fn directory_key(cluster: &str, directory: &str) -> String {
    format!("{}/{}", cluster, directory)
}

/// Strips the sequential suffix a namespace appends to `name.` style nodes.
/// `_0.cfs.0000000003` becomes `_0.cfs`.
pub fn strip_sequence_suffix(node_name: &str) -> &str {
    match node_name.rfind('.') {
        Some(index) => &node_name[..index],
        None => node_name,
    }
}
