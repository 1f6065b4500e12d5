use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::{OrganizationId, OutboxEventId};

use crate::event::Event;

/// Delivery state of an outbox row.
///
/// Rows are always written as `Pending`; the dispatcher owns every other
/// transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    /// Column encoding.
    pub fn as_code(self) -> i16 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Published => 1,
            OutboxStatus::Failed => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(OutboxStatus::Pending),
            1 => Some(OutboxStatus::Published),
            2 => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// A row in the transactional outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub organization_id: Option<OrganizationId>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_version: u32,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub trace_id: Option<String>,
}

impl OutboxEvent {
    /// Build a `Pending` outbox row from a typed event.
    ///
    /// Serializes the event as the payload and copies its metadata so a
    /// consumer can route and deserialize without knowing the Rust type.
    pub fn pending<E>(
        organization_id: Option<OrganizationId>,
        event: &E,
        trace_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, OutboxError>
    where
        E: Event + Serialize,
    {
        let payload =
            serde_json::to_value(event).map_err(|e| OutboxError::Serialization(e.to_string()))?;

        Ok(Self {
            id: OutboxEventId::new(),
            organization_id,
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            payload,
            status: OutboxStatus::Pending,
            occurred_at: event.occurred_at(),
            created_at,
            published_at: None,
            error: None,
            trace_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Pinged {
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }

        fn aggregate_type(&self) -> &'static str {
            "test.pinger"
        }

        fn aggregate_id(&self) -> String {
            "pinger-1".to_string()
        }
    }

    #[test]
    fn pending_row_copies_event_metadata() {
        let at = Utc::now();
        let org = OrganizationId::new();
        let row = OutboxEvent::pending(Some(org), &Pinged { at }, Some("trace-9".into()), at)
            .unwrap();

        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.organization_id, Some(org));
        assert_eq!(row.event_type, "test.pinged");
        assert_eq!(row.event_version, 2);
        assert_eq!(row.aggregate_type, "test.pinger");
        assert_eq!(row.aggregate_id, "pinger-1");
        assert_eq!(row.occurred_at, at);
        assert_eq!(row.trace_id.as_deref(), Some("trace-9"));
        assert!(row.published_at.is_none());
        assert!(row.payload.get("at").is_some());
    }

    #[test]
    fn status_codes_are_stable() {
        for status in [OutboxStatus::Pending, OutboxStatus::Published, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::from_code(status.as_code()), Some(status));
        }
        assert_eq!(OutboxStatus::from_code(7), None);
    }
}
