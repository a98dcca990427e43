//! Provider identity.

use serde::{Deserialize, Serialize};

use crate::{ProviderId, UserId};

/// Who this node is to the orchestrator.
///
/// Resolved once at startup from configuration or persisted credentials and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    /// Stable node identifier.
    pub provider_id: ProviderId,

    /// Account bound at enrollment.
    pub user_id: UserId,
}

impl ProviderIdentity {
    /// Create a new ProviderIdentity.
    pub fn new(provider_id: impl Into<ProviderId>, user_id: impl Into<UserId>) -> Self {
        Self {
            provider_id: provider_id.into(),
            user_id: user_id.into(),
        }
    }
}
