//! JSON catalog snapshots used to seed a query cache from disk.
//!
//! ```json
//! { "entries": [ { "key": ["products", { "page": 1 }], "value": [...] } ] }
//! ```

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::QueryKey;

use super::error::InfraError;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotEntry {
    pub key: QueryKey,
    pub value: Value,
}

/// Read and validate a snapshot file.
pub async fn load(path: &Path) -> Result<CatalogSnapshot, InfraError> {
    let bytes = tokio::fs::read(path).await?;
    parse(path, &bytes)
}

fn parse(path: &Path, bytes: &[u8]) -> Result<CatalogSnapshot, InfraError> {
    let snapshot: CatalogSnapshot =
        serde_json::from_slice(bytes).map_err(|err| InfraError::snapshot(path, err.to_string()))?;

    if let Some(index) = snapshot.entries.iter().position(|entry| entry.key.is_empty()) {
        return Err(InfraError::snapshot(
            path,
            format!("entry {index} has an empty key"),
        ));
    }
    Ok(snapshot)
}
