use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

/// Tag attached to every workflow event, rendered as `[API]`, `[Step:bash]`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogContext {
    Api,
    Workflow,
    Step(&'static str),
    Sandbox,
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogContext::Api => f.write_str("API"),
            LogContext::Workflow => f.write_str("Workflow"),
            LogContext::Step(name) => write!(f, "Step:{name}"),
            LogContext::Sandbox => f.write_str("Sandbox"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Structured event emitted at state transitions and tool invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub context: LogContext,
    pub level:   EventLevel,
    pub run_id:  Option<String>,
    pub message: &'static str,
    pub fields:  Vec<(&'static str, String)>,
}

impl WorkflowEvent {
    pub fn new(context: LogContext, level: EventLevel, message: &'static str) -> Self {
        Self {
            context,
            level,
            run_id: None,
            message,
            fields: Vec::new(),
        }
    }

    pub fn info(context: LogContext, message: &'static str) -> Self {
        Self::new(context, EventLevel::Info, message)
    }

    pub fn warn(context: LogContext, message: &'static str) -> Self {
        Self::new(context, EventLevel::Warn, message)
    }

    pub fn error(context: LogContext, message: &'static str) -> Self {
        Self::new(context, EventLevel::Error, message)
    }

    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    fn rendered_fields(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Destination for workflow events. The core only ever calls `emit`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// Writes events through `tracing` and optionally forwards them to a UI channel.
#[derive(Debug, Default, Clone)]
pub struct TracingSink {
    event_sender: Option<UnboundedSender<WorkflowEvent>>,
}

impl TracingSink {
    pub fn with_event_sender(event_sender: Option<UnboundedSender<WorkflowEvent>>) -> Self {
        Self { event_sender }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: WorkflowEvent) {
        let context = format!("[{}]", event.context);
        let run = event.run_id.as_deref().unwrap_or("-");
        let fields = event.rendered_fields();
        match event.level {
            EventLevel::Info => info!(context = %context, run, "{} {}", event.message, fields),
            EventLevel::Warn => warn!(context = %context, run, "{} {}", event.message, fields),
            EventLevel::Error => {
                error!(context = %context, run, "ERROR: {} {}", event.message, fields)
            }
        }

        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn contexts_render_with_step_names() {
        assert_eq!(LogContext::Api.to_string(), "API");
        assert_eq!(LogContext::Step("git-clone").to_string(), "Step:git-clone");
        assert_eq!(LogContext::Sandbox.to_string(), "Sandbox");
    }

    #[test]
    fn tracing_sink_forwards_events_to_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TracingSink::with_event_sender(Some(tx));
        sink.emit(
            WorkflowEvent::info(LogContext::Workflow, "workflow.started")
                .run("run-1")
                .field("mode", "workflow"),
        );

        let event = rx.try_recv().expect("event forwarded");
        assert_eq!(event.message, "workflow.started");
        assert_eq!(event.run_id.as_deref(), Some("run-1"));
        assert_eq!(event.get("mode"), Some("workflow"));
    }
}
