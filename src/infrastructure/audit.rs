use crate::domain::decision::AuditSnapshot;
use crate::domain::ports::AuditSink;
use crate::error::Result;
use async_trait::async_trait;

/// Emits each snapshot as a JSON line on the `fraudgate::audit` tracing target,
/// leaving shipping and retention to the log pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, snapshot: &AuditSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        tracing::info!(
            target: "fraudgate::audit",
            txn_id = %snapshot.txn_id,
            action = %snapshot.action,
            snapshot = %json,
            "decision recorded"
        );
        Ok(())
    }
}
