use std::sync::Arc;

use deepresearch_core::Telemetry;
use deepresearch_schema::research::Progress;
use deepresearch_schema::wire::ServerMessage;
use uuid::Uuid;

use crate::queue::OutgoingQueue;

/// Adapts the core orchestrator's synchronous `Telemetry` callbacks onto a
/// session's async outgoing queue. Each emit spawns a short-lived task that
/// pushes one wire frame; back-pressure is enforced by the queue itself, not
/// by this adapter.
pub struct QueueTelemetry {
    run_id: Uuid,
    queue: Arc<OutgoingQueue>,
}

impl QueueTelemetry {
    pub fn new(run_id: Uuid, queue: Arc<OutgoingQueue>) -> Self {
        Self { run_id, queue }
    }

    fn push(&self, message: ServerMessage) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            queue.push(message).await;
        });
    }
}

impl Telemetry for QueueTelemetry {
    fn emit_status(&self, _stage: &str, message: &str) {
        self.push(ServerMessage::Status { content: message.to_string() });
    }

    fn emit_progress(&self, progress: Progress) {
        self.push(ServerMessage::Progress { run_id: self.run_id, progress });
    }

    fn emit_thought(&self, text: &str, _stage: &str) {
        self.push(ServerMessage::Thought { content: text.to_string() });
    }

    fn emit_complete(&self, _success: bool) {}
}
