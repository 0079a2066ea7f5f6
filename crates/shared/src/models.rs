//! Session and acknowledgement types exchanged with the sync server.

use serde::{Deserialize, Serialize};

/// Who the connection authenticates as.
///
/// Supplied by the identity collaborator. A change in `user_id` or
/// `tenant_id` invalidates the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub email: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            email: String::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    /// Two identities address the same session when user and tenant match.
    /// The email is informational only.
    pub fn same_session(&self, other: &SessionIdentity) -> bool {
        self.user_id == other.user_id && self.tenant_id == other.tenant_id
    }
}

/// Server verdict carried by `authenticated` and `subscribed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Failure,
}

impl AckStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AckStatus::Success)
    }
}
