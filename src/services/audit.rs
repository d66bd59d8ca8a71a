use async_trait::async_trait;

use crate::models::AuditEvent;
use crate::services::ServiceError;

/// Append-only activity log. Emission is a side effect of the auth
/// flows; callers log and swallow append failures rather than letting
/// them affect the result path.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), ServiceError>;
}

/// Activity log that only emits a tracing event. Useful when no
/// persistent log is wired up.
#[derive(Debug, Clone, Default)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn append(&self, event: AuditEvent) -> Result<(), ServiceError> {
        tracing::info!(
            event_type = %event.event_type_code,
            actor_user_id = ?event.actor_user_id,
            "audit event"
        );
        Ok(())
    }
}
