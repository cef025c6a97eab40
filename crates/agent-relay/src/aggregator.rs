use tracing::debug;

use crate::errors::{RelayError, RemoteFailure};
use crate::event::{EventKind, StreamEvent};

/// Per-invocation accumulator that folds stream events into one reply.
///
/// Starts collecting, becomes terminated on `chat_completed` or `error`, and
/// ignores every event after that.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationState {
    accumulated_text: String,
    final_text: Option<String>,
    terminated: bool,
    failure: Option<RemoteFailure>,
}

impl AggregationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Returns the delta text when the event appended to
    /// the accumulated reply, so streaming consumers can relay it right away.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<String> {
        if self.terminated {
            debug!(kind = %event.kind, "ignoring event after termination");
            return None;
        }
        match &event.kind {
            EventKind::MessageDelta => {
                let text = event.text().filter(|_| event.is_assistant_answer())?;
                self.accumulated_text.push_str(text);
                Some(text.to_string())
            }
            EventKind::MessageCompleted => {
                if self.final_text.is_none()
                    && event.is_assistant_answer()
                    && let Some(text) = event.text()
                {
                    self.final_text = Some(text.to_string());
                }
                None
            }
            EventKind::ChatCompleted => {
                if let Some(usage) = &event.usage {
                    debug!(
                        token_count = ?usage.token_count,
                        input_count = ?usage.input_count,
                        output_count = ?usage.output_count,
                        "chat completed"
                    );
                }
                self.terminated = true;
                None
            }
            EventKind::Error => {
                self.failure = Some(event.error.clone().unwrap_or_else(|| {
                    RemoteFailure::new(None, "agent reported an unspecified error")
                }));
                self.terminated = true;
                None
            }
            EventKind::Unknown(name) => {
                debug!(event = %name, "ignoring unrecognized event");
                None
            }
        }
    }

    /// Marks the end of the stream. A stream that closes while still
    /// collecting finalizes with whatever was accumulated.
    pub fn finish_stream(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }

    pub fn failure(&self) -> Option<&RemoteFailure> {
        self.failure.as_ref()
    }

    /// Resolves the reply: a failure wins, then the completed message, then
    /// the accumulated deltas.
    pub fn resolve(self) -> Result<String, RelayError> {
        if let Some(failure) = self.failure {
            return Err(RelayError::Remote(failure));
        }
        if let Some(text) = self.final_text {
            return Ok(text);
        }
        if !self.accumulated_text.is_empty() {
            return Ok(self.accumulated_text);
        }
        Err(RelayError::EmptyReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_lines;
    use crate::event::Role;

    fn delta(text: &str) -> StreamEvent {
        message(EventKind::MessageDelta, Role::Assistant, text)
    }

    fn completed(text: &str) -> StreamEvent {
        message(EventKind::MessageCompleted, Role::Assistant, text)
    }

    fn message(kind: EventKind, role: Role, text: &str) -> StreamEvent {
        StreamEvent {
            kind,
            role,
            content: Some(text.to_string()),
            message_type: None,
            error: None,
            usage: None,
        }
    }

    fn bare(kind: EventKind) -> StreamEvent {
        StreamEvent {
            kind,
            role: Role::Assistant,
            content: None,
            message_type: None,
            error: None,
            usage: None,
        }
    }

    fn aggregate(events: &[StreamEvent]) -> Result<String, RelayError> {
        let mut state = AggregationState::new();
        for event in events {
            state.apply(event);
        }
        state.finish_stream();
        state.resolve()
    }

    #[test]
    fn deltas_concatenate_in_order_and_are_returned_for_relay() {
        let mut state = AggregationState::new();
        let parts = ["a", "", "bc", "d"];
        let emitted: Vec<_> = parts
            .iter()
            .filter_map(|part| state.apply(&delta(part)))
            .collect();
        assert_eq!(emitted, vec!["a", "bc", "d"]);
        assert_eq!(state.accumulated_text(), "abcd");
    }

    #[test]
    fn user_role_deltas_are_ignored() {
        let events = [
            message(EventKind::MessageDelta, Role::User, "question"),
            delta("answer"),
        ];
        assert_eq!(aggregate(&events).expect("reply"), "answer");
    }

    #[test]
    fn first_completed_message_wins() {
        let mut state = AggregationState::new();
        state.apply(&completed("first"));
        state.apply(&completed("second"));
        assert_eq!(state.final_text(), Some("first"));
        assert!(!state.is_terminated());
    }

    #[test]
    fn empty_completed_message_does_not_claim_final_text() {
        let events = [completed(""), completed("real"), bare(EventKind::ChatCompleted)];
        assert_eq!(aggregate(&events).expect("reply"), "real");
    }

    #[test]
    fn completed_message_beats_accumulated_deltas() {
        let events = [
            delta("hello  world"),
            completed("Hello world."),
            bare(EventKind::ChatCompleted),
        ];
        assert_eq!(aggregate(&events).expect("reply"), "Hello world.");
    }

    #[test]
    fn follow_up_suggestions_are_not_the_reply() {
        let mut follow_up = completed("What else?");
        follow_up.message_type = Some("follow_up".into());
        let events = [delta("Answer"), follow_up, bare(EventKind::ChatCompleted)];
        assert_eq!(aggregate(&events).expect("reply"), "Answer");
    }

    #[test]
    fn error_overrides_partial_content() {
        let mut error = bare(EventKind::Error);
        error.error = Some(RemoteFailure::new(Some(7), "rate limited"));
        let events = [delta("partial"), completed("partial"), error];
        assert_eq!(
            aggregate(&events),
            Err(RelayError::Remote(RemoteFailure::new(Some(7), "rate limited")))
        );
    }

    #[test]
    fn events_after_termination_are_ignored() {
        let events = [
            delta("done"),
            bare(EventKind::ChatCompleted),
            delta(" and more"),
            bare(EventKind::Error),
        ];
        assert_eq!(aggregate(&events).expect("reply"), "done");
    }

    #[test]
    fn unknown_events_do_not_change_state() {
        let mut state = AggregationState::new();
        state.apply(&bare(EventKind::Unknown("conversation.chat.created".into())));
        assert_eq!(state, AggregationState::new());
    }

    #[test]
    fn stream_end_without_content_is_empty_reply() {
        assert_eq!(aggregate(&[]), Err(RelayError::EmptyReply));
        assert_eq!(
            aggregate(&[bare(EventKind::ChatCompleted)]),
            Err(RelayError::EmptyReply)
        );
    }

    #[test]
    fn malformed_lines_do_not_change_result() {
        let clean = [
            r#"data:{"event":"conversation.message.delta","data":{"content":"Hel"}}"#,
            r#"data:{"event":"conversation.message.delta","data":{"content":"lo"}}"#,
            r#"data:{"event":"conversation.chat.completed","data":{}}"#,
        ];
        let noisy = [
            "data:{broken",
            clean[0],
            "data:[1,2,3]",
            clean[1],
            "data:",
            clean[2],
        ];
        assert_eq!(
            aggregate(&decode_lines(clean)),
            aggregate(&decode_lines(noisy))
        );
        assert_eq!(aggregate(&decode_lines(noisy)).expect("reply"), "Hello");
    }

    #[test]
    fn completed_only_stream_yields_final_answer() {
        let events = decode_lines([
            r#"data:{"event":"conversation.message.completed","data":{"role":"assistant","content":"Final answer"}}"#,
            r#"data:{"event":"conversation.chat.completed","data":{}}"#,
        ]);
        assert_eq!(aggregate(&events).expect("reply"), "Final answer");
    }

    #[test]
    fn error_only_stream_is_remote_error() {
        let events = decode_lines([
            r#"data:{"event":"error","data":{},"code":4001,"msg":"bot not found"}"#,
        ]);
        match aggregate(&events) {
            Err(RelayError::Remote(failure)) => assert_eq!(failure.message, "bot not found"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
