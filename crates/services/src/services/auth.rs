//! Identity signal supplied by the external auth collaborator.

use utils::{
    session::anonymous_session_id,
    storage::{KeyValueStorage, StorageError},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No session; state lives on the device. The session id only correlates launches.
    Anonymous { session_id: String },
    Authenticated { user_id: Uuid },
}

impl AuthState {
    /// Anonymous state reusing (or creating) the persisted session id
    pub fn anonymous(storage: &dyn KeyValueStorage) -> Result<Self, StorageError> {
        Ok(Self::Anonymous {
            session_id: anonymous_session_id(storage)?,
        })
    }

    pub fn authenticated(user_id: Uuid) -> Self {
        Self::Authenticated { user_id }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::Authenticated { user_id } => Some(*user_id),
            Self::Anonymous { .. } => None,
        }
    }
}
