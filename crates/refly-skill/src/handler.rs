//! Per-kind callbacks over the event stream.

use refly_common::BaseResponse;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::{EventMeta, StreamEvent};

/// Receives the events of one invocation, in stream order.
///
/// Every method has a no-op default. [`SkillHandler::on_event`] routes each
/// event to its per-kind method and then calls
/// [`SkillHandler::after_event`]; override it to consume events whole.
pub trait SkillHandler: Send {
    /// The envelope was accepted and the stream is about to be read.
    fn on_start(&mut self) {}

    fn on_skill_start(&mut self, _meta: &EventMeta) {}

    fn on_log(&mut self, _meta: &EventMeta, _log: &Value) {}

    fn on_stream(&mut self, _meta: &EventMeta, _content: &str, _reasoning: Option<&str>) {}

    fn on_skill_end(&mut self, _meta: &EventMeta) {}

    fn on_artifact(&mut self, _meta: &EventMeta, _artifact: &Value) {}

    fn on_structured_data(&mut self, _meta: &EventMeta, _data: &Value) {}

    fn on_create_node(&mut self, _meta: &EventMeta, _node: &Value) {}

    fn on_usage(&mut self, _meta: &EventMeta, _usage: &Value) {}

    /// A server-reported or transport failure.
    fn on_error(&mut self, _meta: &EventMeta, _error: &BaseResponse) {}

    /// The invocation ended. `failed` is true when it ended on an error.
    /// Not called when the invocation is aborted.
    fn on_completed(&mut self, _failed: bool) {}

    /// Runs after each dispatched event, e.g. to keep a view scrolled.
    fn after_event(&mut self) {}

    fn on_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::SkillStart { meta } => self.on_skill_start(meta),
            StreamEvent::Log { meta, log } => self.on_log(meta, log),
            StreamEvent::Stream {
                meta,
                content,
                reasoning_content,
            } => self.on_stream(meta, content, reasoning_content.as_deref()),
            StreamEvent::SkillEnd { meta } => self.on_skill_end(meta),
            StreamEvent::Artifact { meta, artifact } => self.on_artifact(meta, artifact),
            StreamEvent::StructuredData { meta, data } => self.on_structured_data(meta, data),
            StreamEvent::CreateNode { meta, node } => self.on_create_node(meta, node),
            StreamEvent::Usage { meta, usage } => self.on_usage(meta, usage),
            StreamEvent::Error { meta, error, .. } => self.on_error(meta, error),
        }
        self.after_event();
    }
}

/// Forwards every event to a channel. Dropped receivers are ignored.
impl SkillHandler for mpsc::UnboundedSender<StreamEvent> {
    fn on_event(&mut self, event: &StreamEvent) {
        let _ = self.send(event.clone());
    }
}
