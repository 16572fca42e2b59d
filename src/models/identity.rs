// Identity context published by the sign-in flow

use serde::{Deserialize, Serialize};

/// Scope a batch is attributed to at the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Current auth state as seen by the pipeline (watch channel value).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub user_id: Option<String>,
    pub is_authenticated: bool,
}

impl AuthState {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_authenticated: true,
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Resolved identity; `None` unless authenticated with a non-empty user id.
    pub fn identity(&self) -> Option<Identity> {
        match (&self.user_id, self.is_authenticated) {
            (Some(id), true) if !id.is_empty() => Some(Identity::new(id.clone())),
            _ => None,
        }
    }
}
