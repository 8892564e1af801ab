use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::storage::{KeyValueStorage, StorageError};

pub const SESSION_KEY: &str = "habitlink_session_id";

/// Opaque id correlating an anonymous actor across launches. Generated on first use and
/// persisted under [`SESSION_KEY`].
pub fn anonymous_session_id(storage: &dyn KeyValueStorage) -> Result<String, StorageError> {
    if let Some(existing) = storage.get(SESSION_KEY)? {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let suffix = Uuid::new_v4().simple().to_string();
    let session_id = format!("session_{}_{}", Utc::now().timestamp_millis(), &suffix[..9]);
    storage.set(SESSION_KEY, &session_id)?;
    debug!(session_id = %session_id, "Generated anonymous session id");
    Ok(session_id)
}
