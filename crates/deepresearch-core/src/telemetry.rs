use deepresearch_schema::research::Progress;

/// Outbound event stream consumed by sessions and dashboards. Replaces the
/// `progressHandler`/`outputHandler`/`errorHandler` callback soup with one
/// narrow trait; the session adapts these calls into wire frames.
pub trait Telemetry: Send + Sync {
    fn emit_status(&self, stage: &str, message: &str);
    fn emit_progress(&self, progress: Progress);
    fn emit_thought(&self, text: &str, stage: &str);
    fn emit_complete(&self, success: bool);
}

/// A telemetry sink that logs through `tracing` and otherwise discards
/// events. Used for non-interactive invocations (tests, headless CLI runs
/// without a connected client).
pub struct LoggingTelemetry;

impl Telemetry for LoggingTelemetry {
    fn emit_status(&self, stage: &str, message: &str) {
        tracing::info!(stage, message, "status");
    }

    fn emit_progress(&self, progress: Progress) {
        tracing::debug!(
            completed = progress.completed_queries,
            total = progress.total_queries,
            percent = progress.percent,
            "progress"
        );
    }

    fn emit_thought(&self, text: &str, stage: &str) {
        tracing::debug!(stage, text, "thought");
    }

    fn emit_complete(&self, success: bool) {
        tracing::info!(success, "run complete");
    }
}

/// Records every emitted event for assertions in tests.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub events: std::sync::Mutex<Vec<String>>,
}

impl Telemetry for RecordingTelemetry {
    fn emit_status(&self, stage: &str, message: &str) {
        self.events.lock().unwrap().push(format!("status:{stage}:{message}"));
    }

    fn emit_progress(&self, progress: Progress) {
        self.events.lock().unwrap().push(format!("progress:{}", progress.percent));
    }

    fn emit_thought(&self, text: &str, stage: &str) {
        self.events.lock().unwrap().push(format!("thought:{stage}:{text}"));
    }

    fn emit_complete(&self, success: bool) {
        self.events.lock().unwrap().push(format!("complete:{success}"));
    }
}
