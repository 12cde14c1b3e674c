use serde::{Serialize, Serializer};

use super::error::QueryError;

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never fetched and never written.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    Success,
    Error,
}

/// Snapshot of one query, handed to observers and returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<QueryError>,
    pub is_fetching: bool,
    pub is_invalidated: bool,
    /// Attempts made by the last failed fetch; reset by a successful write.
    pub failure_count: u32,
    /// Number of successful data writes, from fetches or `set_data`.
    pub data_update_count: u64,
}

impl<T> QueryState<T> {
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            is_invalidated: false,
            failure_count: 0,
            data_update_count: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<QueryError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
