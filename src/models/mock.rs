//! Scriptable model for tests.
//!
//! Each call to [`Model::stream_turn`] pops the next scripted response and
//! replays its events. Requests are recorded so tests can assert on the
//! assembled prompt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Model, ModelEvent, ModelRequest, ModelStream};
use crate::error::{ModelErrorKind, PithError};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Replay these events, optionally pausing before each one.
    Events(Vec<ModelEvent>),
    /// Fail the whole call with a model error.
    Fail(ModelErrorKind, String),
}

/// Deterministic [`Model`] driven by a script.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
    /// Delay inserted before each event (used by deadline tests).
    delay_per_event: Mutex<Duration>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ScriptedStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay_per_event: Mutex::new(Duration::ZERO),
        })
    }

    /// Convenience: a single final text reply.
    pub fn replying(text: &str) -> Arc<Self> {
        Self::new(vec![ScriptedStep::Events(vec![ModelEvent::TextDelta(
            text.to_string(),
        )])])
    }

    pub fn set_delay_per_event(&self, delay: Duration) {
        *self.delay_per_event.lock().unwrap() = delay;
    }

    /// Number of model calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received (test hook).
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream_turn(&self, req: ModelRequest) -> ModelStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);

        let step = self.script.lock().unwrap().pop_front();
        let delay = *self.delay_per_event.lock().unwrap();

        Box::pin(async_stream::stream! {
            match step {
                Some(ScriptedStep::Events(events)) => {
                    for event in events {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        yield Ok(event);
                    }
                }
                Some(ScriptedStep::Fail(kind, detail)) => {
                    yield Err(PithError::Model { kind, detail });
                }
                None => {
                    // Script exhausted: behave like a quiet final reply so
                    // runaway loops terminate deterministically.
                    yield Ok(ModelEvent::TextDelta("(script exhausted)".to_string()));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolCallRequest;
    use futures_util::StreamExt as _;

    fn request() -> ModelRequest {
        ModelRequest {
            system_prompt: "sys".into(),
            messages: vec![],
            tools: vec![],
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn replays_scripted_events_in_order() {
        let model = ScriptedModel::new(vec![ScriptedStep::Events(vec![
            ModelEvent::TextDelta("hel".into()),
            ModelEvent::TextDelta("lo".into()),
            ModelEvent::ToolCall(ToolCallRequest {
                id: "c1".into(),
                name: "echo".into(),
                args: serde_json::json!({"text": "ok"}),
            }),
        ])]);

        let events: Vec<_> = model.stream_turn(request()).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ModelEvent::TextDelta(t) if t == "hel"
        ));
        assert!(matches!(events[2].as_ref().unwrap(), ModelEvent::ToolCall(_)));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn records_requests_for_assertions() {
        let model = ScriptedModel::replying("hi");
        let mut req = request();
        req.system_prompt = "custom prompt".into();
        let _: Vec<_> = model.stream_turn(req).collect().await;
        assert_eq!(model.requests()[0].system_prompt, "custom prompt");
    }

    #[tokio::test]
    async fn failure_step_yields_error() {
        let model = ScriptedModel::new(vec![ScriptedStep::Fail(
            ModelErrorKind::Permanent,
            "bad key".into(),
        )]);
        let events: Vec<_> = model.stream_turn(request()).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}
