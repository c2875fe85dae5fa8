//! One conversation with one content generator.
//!
//! [`Session::send_message`] runs a user message through the pipeline:
//! turn budget, history compaction, session token limit, retried dispatch
//! with streamed forwarding, loop detection, and automatic continuation while
//! the model indicates it has more to say.
//!
//! Limits and failures never surface as `Err`: they end the message with a
//! terminal [`SessionEvent`].

use std::sync::Arc;

use strand_config::Settings;
use strand_context::{CompactionError, Compactor};
use strand_providers::{
    ContentGenerator, GenerationError, PersistentRateLimitHandler, RetryContext, RetryOptions,
    retry_with_backoff,
};
use strand_types::{
    AuthType, CompressionResult, FinishReason, FunctionCall, FunctionResponse, GenerationRequest,
    Message, Part, Role, SamplingParams, StreamEvent, StreamError, ToolDeclaration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{SessionEvent, session_token_limit_message};
use crate::fallback::{FallbackHandler, ModelState};
use crate::loop_detection::LoopDetector;
use crate::next_speaker::{ModelNextSpeakerChecker, NextSpeaker, NextSpeakerChecker};

/// Hard cap on model turns for one user message, continuations included.
pub const MAX_CONTINUATION_TURNS: u32 = 100;
pub const CONTINUE_PROMPT: &str = "Please continue.";

const STREAM_CHANNEL_CAPACITY: usize = 256;

/// A history edit that would leave the conversation malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("function response {id:?} ({name}) does not answer any earlier function call")]
    DanglingFunctionResponse { id: String, name: String },
}

/// First response in `parts` with no matching call in `history`.
///
/// Calls are matched by id; responses without an id match a call of the same
/// name that also has none.
fn dangling_function_response(history: &[Message], parts: &[Part]) -> Option<HistoryError> {
    let calls: Vec<&FunctionCall> = history.iter().flat_map(Message::function_calls).collect();
    parts.iter().find_map(|part| {
        let Part::FunctionResponse(response) = part else {
            return None;
        };
        let answered = calls.iter().any(|call| {
            call.id == response.id && (!call.id.is_empty() || call.name == response.name)
        });
        (!answered).then(|| HistoryError::DanglingFunctionResponse {
            id: response.id.clone(),
            name: response.name.clone(),
        })
    })
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// 0 means unlimited.
    pub max_session_turns: u32,
    /// 0 disables the check.
    pub session_token_limit: u32,
    /// Preamble sent as the system instruction of every call.
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub sampling: SamplingParams,
    pub retry: RetryOptions,
}

impl SessionConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings, auth_type: Option<AuthType>) -> Self {
        let mut retry = RetryOptions::default().with_max_attempts(settings.max_retries);
        retry.auth_type = auth_type;
        Self {
            max_session_turns: settings.max_session_turns,
            session_token_limit: settings.session_token_limit,
            system_instruction: None,
            tools: Vec::new(),
            sampling: settings.sampling,
            retry,
        }
    }
}

enum TurnOutcome {
    /// The model answered. `pending_calls` is true when it asked for tools.
    Completed { pending_calls: bool },
    /// A terminal event was emitted.
    Stopped,
}

/// Messages from the retried dispatch to the consumer side of a turn.
enum Dispatch {
    /// A new attempt started; anything accumulated so far is discarded.
    Attempt { model: String },
    Event(StreamEvent),
}

#[derive(Debug, Default)]
struct TurnOutput {
    model: String,
    text: String,
    function_calls: Vec<FunctionCall>,
    finish_reason: Option<FinishReason>,
    stream_error: Option<StreamError>,
}

impl TurnOutput {
    fn apply(&mut self, event: StreamEvent, events: &mpsc::UnboundedSender<SessionEvent>) {
        match event {
            StreamEvent::TextDelta(text) => {
                self.text.push_str(&text);
                let _ = events.send(SessionEvent::Content(text));
            }
            StreamEvent::FunctionCall(call) => {
                self.function_calls.push(call.clone());
                let _ = events.send(SessionEvent::FunctionCall(call));
            }
            StreamEvent::Usage(usage) => {
                let _ = events.send(SessionEvent::Usage(usage));
            }
            StreamEvent::Finished(reason) => self.finish_reason = Some(reason),
            StreamEvent::Error(error) => self.stream_error = Some(error),
        }
    }

    fn into_message(self) -> Message {
        let mut parts = Vec::with_capacity(self.function_calls.len() + 1);
        if !self.text.is_empty() || self.function_calls.is_empty() {
            parts.push(Part::text(self.text));
        }
        parts.extend(self.function_calls.into_iter().map(Part::FunctionCall));
        Message::new(Role::Model, parts)
    }
}

pub struct Session {
    generator: Arc<dyn ContentGenerator>,
    config: SessionConfig,
    model: ModelState,
    fallback: FallbackHandler,
    compactor: Compactor,
    next_speaker: Arc<dyn NextSpeakerChecker>,
    history: Vec<Message>,
    loop_detector: LoopDetector,
    turn_count: u32,
    last_prompt_id: Option<String>,
}

impl Session {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        model: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let model = ModelState::new(model);
        Self {
            next_speaker: Arc::new(ModelNextSpeakerChecker::new(Arc::clone(&generator))),
            generator,
            config,
            fallback: FallbackHandler::new(model.clone()),
            model,
            compactor: Compactor::default(),
            history: Vec::new(),
            loop_detector: LoopDetector::new(),
            turn_count: 0,
            last_prompt_id: None,
        }
    }

    #[must_use]
    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = compactor;
        self
    }

    #[must_use]
    pub fn with_next_speaker_checker(mut self, checker: Arc<dyn NextSpeakerChecker>) -> Self {
        self.next_speaker = checker;
        self
    }

    #[must_use]
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback = self.fallback.with_fallback_model(model);
        self
    }

    #[must_use]
    pub fn model_state(&self) -> &ModelState {
        &self.model
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn set_history(&mut self, history: Vec<Message>) {
        self.history = history;
    }

    #[must_use]
    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Start over: empty history, fresh turn budget and loop state.
    pub fn reset_chat(&mut self) {
        self.history.clear();
        self.turn_count = 0;
        self.loop_detector.reset();
        self.last_prompt_id = None;
    }

    /// Record tool results without sending them.
    ///
    /// To send results back to the model, pass them as
    /// [`Part::FunctionResponse`] parts to [`Session::send_message`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::DanglingFunctionResponse`] when a response
    /// answers no function call in the history. Nothing is recorded then.
    pub fn add_function_responses(
        &mut self,
        responses: Vec<FunctionResponse>,
    ) -> Result<(), HistoryError> {
        if responses.is_empty() {
            return Ok(());
        }
        let parts: Vec<Part> = responses.into_iter().map(Part::FunctionResponse).collect();
        if let Some(err) = dangling_function_response(&self.history, &parts) {
            return Err(err);
        }
        self.history.push(Message::new(Role::User, parts));
        Ok(())
    }

    /// Compact the history now. `force` skips the token threshold.
    pub async fn try_compress(
        &mut self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionResult>, CompactionError> {
        let model = self.model.current();
        self.compactor
            .try_compress(
                &mut self.history,
                &model,
                force,
                self.generator.as_ref(),
                cancel,
            )
            .await
    }

    /// Handle one user message. Every outcome is reported through `events`.
    pub async fn send_message(
        &mut self,
        parts: Vec<Part>,
        prompt_id: &str,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        if let Some(err) = dangling_function_response(&self.history, &parts) {
            tracing::warn!("Refusing message: {err}");
            let _ = events.send(SessionEvent::error("protocol", err.to_string()));
            return;
        }
        if self.last_prompt_id.as_deref() != Some(prompt_id) {
            self.loop_detector.reset();
            self.last_prompt_id = Some(prompt_id.to_string());
        }

        let initial_model = self.model.current();
        let mut parts = parts;
        for turn in 1..=MAX_CONTINUATION_TURNS {
            let TurnOutcome::Completed { pending_calls } =
                self.run_turn(parts, cancel, events).await
            else {
                return;
            };
            if pending_calls || cancel.is_cancelled() || self.model.current() != initial_model {
                return;
            }

            let model = self.model.current();
            match self.next_speaker.check(&self.history, &model, cancel).await {
                Some(NextSpeaker::Model) => {
                    tracing::debug!(turn, "Model continues speaking");
                    parts = vec![Part::text(CONTINUE_PROMPT)];
                }
                _ => return,
            }
        }
        tracing::warn!(
            max_turns = MAX_CONTINUATION_TURNS,
            "Stopped automatic continuation at the turn cap"
        );
    }

    async fn run_turn(
        &mut self,
        parts: Vec<Part>,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> TurnOutcome {
        self.turn_count += 1;
        if self.config.max_session_turns > 0 && self.turn_count > self.config.max_session_turns {
            let _ = events.send(SessionEvent::MaxSessionTurns);
            return TurnOutcome::Stopped;
        }

        match self.try_compress(false, cancel).await {
            Ok(Some(result)) => {
                let _ = events.send(SessionEvent::ChatCompressed(result));
            }
            Ok(None) => {}
            Err(CompactionError::Generation(GenerationError::Cancelled)) => {
                let err = GenerationError::Cancelled;
                let _ = events.send(SessionEvent::error(err.stage(), err.to_string()));
                return TurnOutcome::Stopped;
            }
            Err(e) => tracing::warn!("History compaction failed: {e}"),
        }

        let user = Message::new(Role::User, parts);
        let model = self.model.current();

        let limit = self.config.session_token_limit;
        if limit > 0 {
            match self.count_request_tokens(&model, &user, cancel).await {
                Ok(current) if current > limit => {
                    let _ = events.send(SessionEvent::SessionTokenLimitExceeded {
                        current,
                        limit,
                        message: session_token_limit_message(current, limit),
                    });
                    return TurnOutcome::Stopped;
                }
                Ok(_) => {}
                Err(GenerationError::Cancelled) => {
                    let err = GenerationError::Cancelled;
                    let _ = events.send(SessionEvent::error(err.stage(), err.to_string()));
                    return TurnOutcome::Stopped;
                }
                Err(e) => tracing::warn!("Could not count session tokens: {e}"),
            }
        }

        let mut contents = self.history.clone();
        contents.push(user.clone());
        let request = self.build_request(&model, contents);

        let (result, output) = self.dispatch(request, cancel, events).await;

        if self.loop_detector.detected() {
            let _ = events.send(SessionEvent::LoopDetected);
            return TurnOutcome::Stopped;
        }
        if !output.model.is_empty() && output.model != model {
            let _ = events.send(SessionEvent::ModelSwitched {
                from: model,
                to: output.model.clone(),
            });
        }
        if let Err(err) = result {
            tracing::warn!(stage = err.stage(), "Generation failed: {err}");
            let _ = events.send(SessionEvent::error(err.stage(), err.to_string()));
            return TurnOutcome::Stopped;
        }
        if let Some(error) = output.stream_error.clone() {
            let err = GenerationError::from(error);
            tracing::warn!(stage = err.stage(), "Stream failed: {err}");
            let _ = events.send(SessionEvent::error(err.stage(), err.to_string()));
            return TurnOutcome::Stopped;
        }

        let pending_calls = !output.function_calls.is_empty();
        let finish_reason = output.finish_reason.clone().unwrap_or_default();
        self.history.push(user);
        self.history.push(output.into_message());
        let _ = events.send(SessionEvent::Finished(finish_reason));
        TurnOutcome::Completed { pending_calls }
    }

    fn build_request(&self, model: &str, contents: Vec<Message>) -> GenerationRequest {
        let mut request = GenerationRequest::new(model, contents)
            .with_tools(self.config.tools.clone())
            .with_config(self.config.sampling);
        if let Some(system) = &self.config.system_instruction {
            request = request.with_system_instruction(system.clone());
        }
        request
    }

    /// Token count of the would-be request: preamble, history and `user`.
    async fn count_request_tokens(
        &self,
        model: &str,
        user: &Message,
        cancel: &CancellationToken,
    ) -> strand_providers::Result<u32> {
        let mut contents = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.config.system_instruction {
            contents.push(Message::system_text(system.clone()));
        }
        contents.extend(self.history.iter().cloned());
        contents.push(user.clone());
        self.generator
            .count_tokens(&GenerationRequest::new(model, contents), cancel)
            .await
    }

    /// Run the retried stream while forwarding events as they arrive.
    async fn dispatch(
        &mut self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> (strand_providers::Result<()>, TurnOutput) {
        let (relay_tx, relay_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let turn_cancel = cancel.child_token();

        let generator = Arc::clone(&self.generator);
        let fallback = self.fallback.clone();
        let options = self.config.retry.clone();
        let dispatch_cancel = turn_cancel.clone();
        let dispatch = async move {
            let handler: &dyn PersistentRateLimitHandler = &fallback;
            let result = retry_with_backoff(
                |context: RetryContext| {
                    let mut request = request.clone();
                    if let Some(model) = context.model {
                        request.model = model;
                    }
                    let relay = relay_tx.clone();
                    let generator = Arc::clone(&generator);
                    let cancel = dispatch_cancel.clone();
                    async move { stream_attempt(generator.as_ref(), request, relay, &cancel).await }
                },
                &options,
                Some(handler),
                &dispatch_cancel,
            )
            .await;
            drop(relay_tx);
            result
        };

        let consume = consume_turn(relay_rx, &mut self.loop_detector, events, &turn_cancel);
        tokio::join!(dispatch, consume)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model)
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .field("turn_count", &self.turn_count)
            .finish_non_exhaustive()
    }
}

async fn stream_attempt(
    generator: &dyn ContentGenerator,
    request: GenerationRequest,
    relay: mpsc::Sender<Dispatch>,
    cancel: &CancellationToken,
) -> strand_providers::Result<()> {
    let model = request.model.clone();
    if relay.send(Dispatch::Attempt { model }).await.is_err() {
        return Err(GenerationError::Cancelled);
    }

    let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let forward = async {
        while let Some(event) = rx.recv().await {
            if relay.send(Dispatch::Event(event)).await.is_err() {
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(generator.generate_stream(&request, tx, cancel), forward);
    result
}

async fn consume_turn(
    mut rx: mpsc::Receiver<Dispatch>,
    detector: &mut LoopDetector,
    events: &mpsc::UnboundedSender<SessionEvent>,
    turn_cancel: &CancellationToken,
) -> TurnOutput {
    let mut output = TurnOutput::default();
    while let Some(message) = rx.recv().await {
        if detector.detected() {
            continue;
        }
        match message {
            Dispatch::Attempt { model } => {
                output = TurnOutput {
                    model,
                    ..TurnOutput::default()
                };
            }
            Dispatch::Event(event) => {
                let looped = match &event {
                    StreamEvent::TextDelta(text) => detector.add_content(text),
                    StreamEvent::FunctionCall(call) => detector.add_tool_call(call),
                    _ => false,
                };
                if looped {
                    turn_cancel.cancel();
                    continue;
                }
                output.apply(event, events);
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use strand_types::{GenerationResponse, TokenUsage};

    use crate::fallback::FALLBACK_MODEL;

    type Script = Vec<StreamEvent>;

    /// Streams scripted turns; `Err` entries fail the attempt.
    struct ScriptedGenerator {
        turns: Mutex<VecDeque<Result<Script, GenerationError>>>,
        token_count: u32,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        fn new(turns: Vec<Result<Script, GenerationError>>) -> Arc<Self> {
            Self::with_token_count(turns, 10)
        }

        fn with_token_count(turns: Vec<Result<Script, GenerationError>>, token_count: u32) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                token_count,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _cancel: &CancellationToken,
        ) -> strand_providers::Result<GenerationResponse> {
            Ok(GenerationResponse::default())
        }

        async fn generate_stream(
            &self,
            request: &GenerationRequest,
            tx: mpsc::Sender<StreamEvent>,
            cancel: &CancellationToken,
        ) -> strand_providers::Result<()> {
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            let next = self.turns.lock().unwrap().pop_front();
            let script = match next {
                Some(Ok(script)) => script,
                Some(Err(err)) => return Err(err),
                None => vec![
                    StreamEvent::TextDelta(format!("part {n}. ")),
                    StreamEvent::Finished(FinishReason::Stop),
                ],
            };
            for event in script {
                if cancel.is_cancelled() {
                    return Err(GenerationError::Cancelled);
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(())
        }

        async fn count_tokens(
            &self,
            _request: &GenerationRequest,
            _cancel: &CancellationToken,
        ) -> strand_providers::Result<u32> {
            Ok(self.token_count)
        }

        async fn embed(
            &self,
            _texts: &[String],
            _cancel: &CancellationToken,
        ) -> strand_providers::Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
    }

    /// Answers from a fixed list, then `User`.
    struct ScriptedSpeaker {
        answers: Mutex<VecDeque<NextSpeaker>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSpeaker {
        fn new(answers: &[NextSpeaker]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::new(0),
            })
        }

        fn always_model() -> Arc<Self> {
            Self::new(&[NextSpeaker::Model; MAX_CONTINUATION_TURNS as usize + 10])
        }
    }

    #[async_trait]
    impl NextSpeakerChecker for ScriptedSpeaker {
        async fn check(
            &self,
            _history: &[Message],
            _model: &str,
            _cancel: &CancellationToken,
        ) -> Option<NextSpeaker> {
            *self.calls.lock().unwrap() += 1;
            Some(
                self.answers
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(NextSpeaker::User),
            )
        }
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            persistent_429_threshold: 2,
            auth_type: None,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            retry: fast_retry(),
            ..SessionConfig::default()
        }
    }

    fn session(generator: Arc<ScriptedGenerator>, config: SessionConfig) -> Session {
        Session::new(generator, "gemini-2.5-pro", config)
            .with_next_speaker_checker(ScriptedSpeaker::new(&[]))
    }

    fn text_turn(text: &str) -> Result<Script, GenerationError> {
        Ok(vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 1,
                total_tokens: 4,
            }),
            StreamEvent::Finished(FinishReason::Stop),
        ])
    }

    async fn send(session: &mut Session, text: &str, prompt_id: &str) -> Vec<SessionEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .send_message(vec![Part::text(text)], prompt_id, &CancellationToken::new(), &tx)
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_and_records_turn() {
        let generator = ScriptedGenerator::new(vec![text_turn("hello")]);
        let mut session = session(generator.clone(), config());

        let events = send(&mut session, "hi", "p1").await;
        assert_eq!(events[0], SessionEvent::Content("hello".into()));
        assert!(matches!(events[1], SessionEvent::Usage(_)));
        assert_eq!(events[2], SessionEvent::Finished(FinishReason::Stop));
        assert_eq!(events.len(), 3);

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].text(), "hi");
        assert_eq!(session.history()[1].role, Role::Model);
        assert_eq!(session.history()[1].text(), "hello");
        assert_eq!(generator.requests()[0].contents.len(), 1);
    }

    #[tokio::test]
    async fn max_session_turns_stops_without_dispatch() {
        let generator = ScriptedGenerator::new(vec![text_turn("one")]);
        let mut session = session(
            generator.clone(),
            SessionConfig {
                max_session_turns: 1,
                ..config()
            },
        );

        send(&mut session, "first", "p1").await;
        let events = send(&mut session, "second", "p2").await;
        assert_eq!(events, vec![SessionEvent::MaxSessionTurns]);
        assert_eq!(generator.requests().len(), 1);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn session_token_limit_stops_without_dispatch() {
        let generator = ScriptedGenerator::with_token_count(vec![text_turn("never")], 500);
        let mut session = session(
            generator.clone(),
            SessionConfig {
                session_token_limit: 100,
                ..config()
            },
        );

        let events = send(&mut session, "hi", "p1").await;
        let [SessionEvent::SessionTokenLimitExceeded { current, limit, message }] = events.as_slice()
        else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!((*current, *limit), (500, 100));
        assert!(message.contains("500 tokens > 100 limit"));
        assert!(generator.requests().is_empty());
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn function_calls_are_forwarded_without_continuation() {
        let call = FunctionCall::new("call_1", "read_file", json!({"path": "a.rs"}));
        let generator = ScriptedGenerator::new(vec![Ok(vec![
            StreamEvent::FunctionCall(call.clone()),
            StreamEvent::Finished(FinishReason::ToolCalls),
        ])]);
        let speaker = ScriptedSpeaker::always_model();
        let mut session =
            Session::new(generator.clone(), "m", config()).with_next_speaker_checker(speaker.clone());

        let events = send(&mut session, "read it", "p1").await;
        assert_eq!(events[0], SessionEvent::FunctionCall(call.clone()));
        assert_eq!(*speaker.calls.lock().unwrap(), 0);
        assert_eq!(generator.requests().len(), 1);

        let recorded = &session.history()[1];
        assert_eq!(recorded.function_calls().collect::<Vec<_>>(), vec![&call]);
    }

    #[tokio::test]
    async fn continues_while_model_should_speak() {
        let generator =
            ScriptedGenerator::new(vec![text_turn("Next, I will"), text_turn(" finish.")]);
        let speaker = ScriptedSpeaker::new(&[NextSpeaker::Model]);
        let mut session =
            Session::new(generator.clone(), "m", config()).with_next_speaker_checker(speaker.clone());

        let events = send(&mut session, "go", "p1").await;
        let finished = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Finished(_)))
            .count();
        assert_eq!(finished, 2);
        assert_eq!(*speaker.calls.lock().unwrap(), 2);

        let requests = generator.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].contents.last().unwrap().text(), CONTINUE_PROMPT);
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn continuation_is_capped() {
        let generator = ScriptedGenerator::new(Vec::new());
        let mut session = Session::new(generator.clone(), "m", config())
            .with_next_speaker_checker(ScriptedSpeaker::always_model());

        send(&mut session, "go", "p1").await;
        assert_eq!(generator.requests().len(), MAX_CONTINUATION_TURNS as usize);
        assert_eq!(session.turn_count(), MAX_CONTINUATION_TURNS);
    }

    #[tokio::test]
    async fn continuation_respects_turn_budget() {
        let generator = ScriptedGenerator::new(Vec::new());
        let mut session = Session::new(
            generator.clone(),
            "m",
            SessionConfig {
                max_session_turns: 3,
                ..config()
            },
        )
        .with_next_speaker_checker(ScriptedSpeaker::always_model());

        let events = send(&mut session, "go", "p1").await;
        assert_eq!(generator.requests().len(), 3);
        assert_eq!(events.last(), Some(&SessionEvent::MaxSessionTurns));
    }

    #[tokio::test]
    async fn repeated_tool_calls_stop_the_turn() {
        let call = FunctionCall::new("call_1", "ls", json!({"dir": "."}));
        let script = (0..8)
            .map(|_| StreamEvent::FunctionCall(call.clone()))
            .chain([StreamEvent::Finished(FinishReason::ToolCalls)])
            .collect();
        let generator = ScriptedGenerator::new(vec![Ok(script)]);
        let mut session = session(generator, config());

        let events = send(&mut session, "list", "p1").await;
        let forwarded = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::FunctionCall(_)))
            .count();
        assert_eq!(forwarded, 4);
        assert_eq!(events.last(), Some(&SessionEvent::LoopDetected));
        assert!(session.history().is_empty());

        // A new prompt starts with a clean detector.
        let events = send(&mut session, "again", "p2").await;
        assert_eq!(events.last(), Some(&SessionEvent::Finished(FinishReason::Stop)));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::from_status(503, "busy".into(), None)),
            text_turn("recovered"),
        ]);
        let mut session = session(generator.clone(), config());

        let events = send(&mut session, "hi", "p1").await;
        assert_eq!(events[0], SessionEvent::Content("recovered".into()));
        assert_eq!(generator.requests().len(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_become_events() {
        let generator = ScriptedGenerator::new(vec![Err(GenerationError::from_status(
            429,
            "Free allocated quota exceeded.".into(),
            None,
        ))]);
        let mut session = session(generator.clone(), config());

        let events = send(&mut session, "hi", "p1").await;
        let [SessionEvent::Error { stage, message }] = events.as_slice() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(stage, "quota");
        assert!(message.contains("quota"));
        assert_eq!(generator.requests().len(), 1);
        assert!(session.history().is_empty());
    }

    async fn stream_failure(error: StreamError) -> (Session, Vec<SessionEvent>) {
        let generator = ScriptedGenerator::new(vec![Ok(vec![
            StreamEvent::TextDelta("par".into()),
            StreamEvent::Error(error),
        ])]);
        let mut session = session(generator, config());
        let events = send(&mut session, "hi", "p1").await;
        (session, events)
    }

    #[tokio::test]
    async fn stream_error_is_terminal() {
        let (session, events) = stream_failure(StreamError::Network(
            "Connection closed before stream completed".into(),
        ))
        .await;
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Error {
                stage: "network".into(),
                message: "network error: Connection closed before stream completed".into(),
            })
        );
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn mid_stream_quota_error_reports_quota_stage() {
        let (session, events) = stream_failure(StreamError::Upstream {
            status: None,
            code: Some("insufficient_quota".into()),
            message: "You exceeded your current quota".into(),
        })
        .await;
        let Some(SessionEvent::Error { stage, message }) = events.last() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(stage, "quota");
        assert!(message.contains("exceeded your current quota"));
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn undecodable_stream_payload_reports_protocol_stage() {
        let (session, events) = stream_failure(StreamError::Protocol(
            "Invalid chat completion chunk: invalid type".into(),
        ))
        .await;
        let Some(SessionEvent::Error { stage, .. }) = events.last() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(stage, "protocol");
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_with_status_uses_status_classification() {
        let (_, events) = stream_failure(StreamError::Upstream {
            status: Some(401),
            code: None,
            message: "Request had invalid authentication credentials.".into(),
        })
        .await;
        let Some(SessionEvent::Error { stage, .. }) = events.last() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(stage, "auth");
    }

    #[tokio::test]
    async fn persistent_rate_limit_switches_to_fallback_model() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::from_status(429, "slow down".into(), None)),
            Err(GenerationError::from_status(429, "slow down".into(), None)),
            text_turn("flash here"),
        ]);
        let mut retry = fast_retry();
        retry.auth_type = Some(AuthType::LoginWithGoogle);
        let speaker = ScriptedSpeaker::always_model();
        let mut session = Session::new(generator.clone(), "gemini-2.5-pro", SessionConfig {
            retry,
            ..SessionConfig::default()
        })
        .with_next_speaker_checker(speaker.clone());

        let events = send(&mut session, "hi", "p1").await;
        assert!(events.contains(&SessionEvent::ModelSwitched {
            from: "gemini-2.5-pro".into(),
            to: FALLBACK_MODEL.into(),
        }));
        assert_eq!(session.model_state().current(), FALLBACK_MODEL);
        assert!(session.model_state().in_fallback());
        assert_eq!(generator.requests()[2].model, FALLBACK_MODEL);
        // No automatic continuation after a mid-turn model switch.
        assert_eq!(*speaker.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_reports_error() {
        let generator = ScriptedGenerator::new(vec![text_turn("never")]);
        let mut session = session(generator.clone(), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .send_message(vec![Part::text("hi")], "p1", &cancel, &tx)
            .await;
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Error { .. }));
        assert!(generator.requests().is_empty());
    }

    fn history_with_call(id: &str) -> Vec<Message> {
        vec![
            Message::user_text("read"),
            Message::new(
                Role::Model,
                vec![Part::FunctionCall(FunctionCall::new(id, "read", json!({})))],
            ),
        ]
    }

    #[tokio::test]
    async fn function_responses_and_reset() {
        let generator = ScriptedGenerator::new(Vec::new());
        let mut session = session(generator, config());
        session.set_history(history_with_call("c1"));
        session
            .add_function_responses(vec![FunctionResponse::new("c1", "read", json!({"ok": true}))])
            .unwrap();
        assert_eq!(session.history().len(), 3);
        assert!(session.history()[2].is_function_response());

        session.add_function_responses(Vec::new()).unwrap();
        assert_eq!(session.history().len(), 3);

        session.reset_chat();
        assert!(session.history().is_empty());
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_function_response_is_not_recorded() {
        let generator = ScriptedGenerator::new(Vec::new());
        let mut session = session(generator, config());
        session.set_history(history_with_call("c1"));

        let err = session
            .add_function_responses(vec![
                FunctionResponse::new("c1", "read", json!({"ok": true})),
                FunctionResponse::new("ghost", "read", json!({"ok": true})),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            HistoryError::DanglingFunctionResponse {
                id: "ghost".into(),
                name: "read".into(),
            }
        );
        assert_eq!(session.history(), history_with_call("c1").as_slice());
    }

    #[tokio::test]
    async fn unmatched_function_response_is_not_sent() {
        let generator = ScriptedGenerator::new(vec![text_turn("never")]);
        let mut session = session(generator.clone(), config());
        session.set_history(history_with_call("c1"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .send_message(
                vec![Part::FunctionResponse(FunctionResponse::new(
                    "ghost2",
                    "read",
                    json!({"ok": true}),
                ))],
                "p1",
                &CancellationToken::new(),
                &tx,
            )
            .await;
        drop(tx);
        let event = rx.recv().await.unwrap();
        let SessionEvent::Error { stage, message } = &event else {
            panic!("unexpected event: {event:?}");
        };
        assert_eq!(stage, "protocol");
        assert!(message.contains("ghost2"));
        assert!(rx.recv().await.is_none());
        assert!(generator.requests().is_empty());
        assert_eq!(session.turn_count(), 0);
        assert_eq!(session.history(), history_with_call("c1").as_slice());
    }

    #[tokio::test]
    async fn matching_function_response_is_sent() {
        let generator = ScriptedGenerator::new(vec![text_turn("done")]);
        let mut session = session(generator.clone(), config());
        session.set_history(history_with_call("c1"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .send_message(
                vec![Part::FunctionResponse(FunctionResponse::new(
                    "c1",
                    "read",
                    json!({"ok": true}),
                ))],
                "p1",
                &CancellationToken::new(),
                &tx,
            )
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&SessionEvent::Finished(FinishReason::Stop)));
        assert_eq!(generator.requests().len(), 1);
        assert_eq!(session.history().len(), 4);
    }
}
