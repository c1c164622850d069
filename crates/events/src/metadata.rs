//! Correlation/audit metadata carried alongside every command and event.
//!
//! Business logic never writes these fields. The outbound interceptor chain
//! stamps them from the ambient context before a command reaches its handler,
//! and the resulting events inherit them unchanged (they are persisted into
//! the event record's `metadata` column).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidemark_core::{TenantId, UserId};

/// Metadata stamped onto commands and inherited by the events they produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Tenant the unit of work is acting for. Mandatory by the time a command
    /// reaches the append engine; the stamping interceptor rejects commands
    /// that cannot resolve one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,

    /// Acting user, when the unit of work has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    /// Correlates every event caused by one inbound request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// The message that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata pre-scoped to a tenant (useful for tests and replay tooling).
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let json = serde_json::to_value(EventMetadata::new()).expect("serialize");
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn round_trips_through_json() {
        let meta = EventMetadata::for_tenant(TenantId::new()).with_user(UserId::new());
        let json = serde_json::to_value(&meta).expect("serialize");
        let back: EventMetadata = serde_json::from_value(json).expect("deserialize");
        assert_eq!(meta, back);
    }
}
