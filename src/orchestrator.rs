//! one request/response cycle at a time.
//!
//! `send` and `handle` run on the main thread and are the only writers of
//! the conversation. `run_turn` is the background half: it drives the
//! transport and parser and reports back through the inbox channel.

use crate::config::ChatConfig;
use crate::conversation::{ChatMessage, Conversation};
use crate::error::SendRejected;
use crate::parser::{StreamEvent, StreamParser};
use crate::transport::{StreamRequest, Transport};
use bevy::log::{debug, error, info, warn};
use bevy::prelude::Resource;
use flume::Sender;
use futures_lite::StreamExt;
use serde::Serialize;
use std::sync::Arc;

/// chat-completions request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TurnId(pub u64);

/// the display side. called on the main thread only, in wire order.
pub trait ChatObserver {
    /// incremental assistant text; append it, don't replace.
    fn on_delta(&mut self, text: &str);
    /// the assistant message was committed and the next send is allowed.
    fn on_turn_complete(&mut self, message: &ChatMessage);
    fn on_user_message_committed(&mut self, message: &ChatMessage);
}

/// worker → main thread messages, tagged with the turn they belong to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMsg {
    Delta { turn: TurnId, text: String },
    Done { turn: TurnId },
    /// `error` is already phrased for display.
    Failed { turn: TurnId, error: String },
}

impl StreamMsg {
    pub fn turn(&self) -> TurnId {
        match self {
            Self::Delta { turn, .. } | Self::Done { turn } | Self::Failed { turn, .. } => *turn,
        }
    }
}

/// the in-progress assistant reply. lives from `send` until the stream
/// finishes or fails.
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    prompt: Arc<[ChatMessage]>,
    text: String,
}

impl Turn {
    fn new(id: TurnId, prompt: Arc<[ChatMessage]>) -> Self {
        Self { id, prompt, text: String::new() }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    /// conversation as it was when the request was sent.
    pub fn prompt(&self) -> &[ChatMessage] {
        &self.prompt
    }

    /// assistant text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    fn into_message(self) -> ChatMessage {
        ChatMessage::assistant(self.text)
    }
}

/// a started turn that still has to be spawned onto a background worker
/// with [`run_turn`].
pub struct TurnJob {
    pub id: TurnId,
    pub request: StreamRequest,
    pub transport: Arc<dyn Transport>,
}

/// owns the conversation and the single in-flight turn.
#[derive(Resource)]
pub struct ChatOrchestrator {
    config: ChatConfig,
    transport: Arc<dyn Transport>,
    conversation: Conversation,
    turn: Option<Turn>,
    next_turn: u64,
}

impl ChatOrchestrator {
    pub fn new(config: ChatConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            conversation: Conversation::new(),
            turn: None,
            next_turn: 0,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn current_turn(&self) -> Option<&Turn> {
        self.turn.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.turn.is_some()
    }

    /// commits the user message and opens a turn. blank input and sends
    /// while a turn is active change nothing.
    pub fn send(
        &mut self,
        user_text: &str,
        observer: &mut impl ChatObserver,
    ) -> Result<TurnJob, SendRejected> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(SendRejected::Empty);
        }
        if self.turn.is_some() {
            return Err(SendRejected::Busy);
        }

        let message = ChatMessage::user(text);
        self.conversation.append(message.clone());
        observer.on_user_message_committed(&message);

        let prompt = self.conversation.snapshot();
        let request = StreamRequest {
            endpoint: self.config.endpoint(),
            headers: self.config.headers(),
            payload: self.build_payload(&prompt),
        };

        let id = TurnId(self.next_turn);
        self.next_turn += 1;
        self.turn = Some(Turn::new(id, prompt));

        info!(target: "bevy_unillm", "turn {} started: history={}", id.0, self.conversation.len());
        Ok(TurnJob { id, request, transport: self.transport.clone() })
    }

    fn build_payload(&self, history: &[ChatMessage]) -> CompletionRequest {
        let system = self.config.system_prompt.as_deref().map(ChatMessage::system);
        CompletionRequest {
            model: self.config.model.clone(),
            messages: system.into_iter().chain(history.iter().cloned()).collect(),
            stream: true,
        }
    }

    /// applies one worker message. messages for any turn but the active one
    /// are dropped.
    pub fn handle(&mut self, msg: StreamMsg, observer: &mut impl ChatObserver) {
        let id = msg.turn();
        let turn = match self.turn.as_mut() {
            Some(turn) if turn.id == id => turn,
            _ => {
                warn!(target: "bevy_unillm", "dropping message for stale turn {}", id.0);
                return;
            }
        };

        match msg {
            StreamMsg::Delta { text, .. } => {
                turn.text.push_str(&text);
                observer.on_delta(&text);
            }
            StreamMsg::Done { .. } => self.finalize(observer),
            StreamMsg::Failed { error, .. } => {
                let shown = if turn.text.is_empty() { error } else { format!("\n{error}") };
                turn.text.push_str(&shown);
                observer.on_delta(&shown);
                self.finalize(observer);
            }
        }
    }

    fn finalize(&mut self, observer: &mut impl ChatObserver) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        let id = turn.id;
        let message = turn.into_message();
        info!(target: "bevy_unillm", "turn {} completed: final_len={}", id.0, message.content.len());
        self.conversation.append(message.clone());
        observer.on_turn_complete(&message);
    }
}

async fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    // a closed inbox means the app is shutting down
    let _ = tx.send_async(msg).await;
}

/// background half of a turn: stream the completion and report every
/// non-empty delta, then exactly one `Done` or `Failed`.
pub async fn run_turn(job: TurnJob, tx: Sender<StreamMsg>) {
    let TurnJob { id, request, transport } = job;

    let mut chunks = match transport.open_stream(request).await {
        Ok(chunks) => chunks,
        Err(err) => {
            error!(target: "bevy_unillm", "turn {} failed to open stream: {}", id.0, err);
            push_inbox(&tx, StreamMsg::Failed { turn: id, error: err.user_message() }).await;
            return;
        }
    };

    let mut parser = StreamParser::new();
    let mut received = 0usize;
    while let Some(item) = chunks.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(target: "bevy_unillm", "turn {} stream error: {}", id.0, err);
                push_inbox(&tx, StreamMsg::Failed { turn: id, error: err.user_message() }).await;
                return;
            }
        };
        received += bytes.len();

        let events: Vec<StreamEvent> = parser.consume(&bytes).collect();
        for event in events {
            match event {
                StreamEvent::ContentDelta(text) if text.is_empty() => {}
                StreamEvent::ContentDelta(text) => {
                    push_inbox(&tx, StreamMsg::Delta { turn: id, text }).await;
                }
                StreamEvent::Terminate => {
                    debug!(target: "bevy_unillm", "turn {} saw end sentinel after {} bytes", id.0, received);
                    push_inbox(&tx, StreamMsg::Done { turn: id }).await;
                    return;
                }
            }
        }
    }

    if let Some(StreamEvent::ContentDelta(text)) = parser.finish()
        && !text.is_empty()
    {
        push_inbox(&tx, StreamMsg::Delta { turn: id, text }).await;
    }
    debug!(target: "bevy_unillm", "turn {} stream closed after {} bytes", id.0, received);
    push_inbox(&tx, StreamMsg::Done { turn: id }).await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::error::TransportError;
    use crate::transport::ChunkStream;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum Seen {
        User(String),
        Delta(String),
        Complete(String),
    }

    #[derive(Default)]
    pub(crate) struct Recorder(pub(crate) Vec<Seen>);

    impl ChatObserver for Recorder {
        fn on_delta(&mut self, text: &str) {
            self.0.push(Seen::Delta(text.to_string()));
        }
        fn on_turn_complete(&mut self, message: &ChatMessage) {
            self.0.push(Seen::Complete(message.content.clone()));
        }
        fn on_user_message_committed(&mut self, message: &ChatMessage) {
            self.0.push(Seen::User(message.content.clone()));
        }
    }

    pub(crate) enum Script {
        Chunks(Vec<Result<Vec<u8>, TransportError>>),
        RefuseConnection,
    }

    /// transport that replays a fixed script and counts calls.
    pub(crate) struct FakeTransport {
        script: Mutex<Option<Script>>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<StreamRequest>>,
    }

    impl FakeTransport {
        pub(crate) fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Some(script)),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        pub(crate) fn frames(frames: &[&str]) -> Arc<Self> {
            let chunks = frames.iter().map(|f| Ok(f.as_bytes().to_vec())).collect();
            Self::new(Script::Chunks(chunks))
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_stream(&self, request: StreamRequest) -> Result<ChunkStream, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);
            match self.script.lock().unwrap().take() {
                Some(Script::Chunks(chunks)) => Ok(Box::pin(futures_lite::stream::iter(chunks))),
                Some(Script::RefuseConnection) | None => {
                    Err(TransportError::Connection("tcp connect error: connection refused".into()))
                }
            }
        }
    }

    pub(crate) fn content_frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    fn orchestrator(transport: Arc<FakeTransport>) -> ChatOrchestrator {
        let config = ChatConfig::default().with_api_key("sk-test").with_model("test-model");
        ChatOrchestrator::new(config, transport)
    }

    async fn drive(chat: &mut ChatOrchestrator, job: TurnJob, seen: &mut Recorder) {
        let (tx, rx) = flume::unbounded();
        run_turn(job, tx).await;
        for msg in rx.drain() {
            chat.handle(msg, seen);
        }
    }

    #[tokio::test]
    async fn streamed_deltas_commit_one_assistant_message() {
        let hel = content_frame("Hel");
        let lo = content_frame("lo");
        let transport = FakeTransport::frames(&[&hel, &lo]);
        let mut chat = orchestrator(transport.clone());
        let mut seen = Recorder::default();

        let job = chat.send("hi", &mut seen).unwrap();
        assert!(chat.is_in_flight());
        drive(&mut chat, job, &mut seen).await;

        assert_eq!(
            seen.0,
            vec![
                Seen::User("hi".into()),
                Seen::Delta("Hel".into()),
                Seen::Delta("lo".into()),
                Seen::Complete("Hello".into()),
            ]
        );
        assert!(!chat.is_in_flight());
        assert_eq!(
            chat.conversation().messages(),
            &[ChatMessage::user("hi"), ChatMessage::assistant("Hello")]
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let sent = transport.last_request.lock().unwrap().take().unwrap();
        assert_eq!(sent.payload.messages, vec![ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn connection_error_becomes_assistant_reply() {
        let transport = FakeTransport::new(Script::RefuseConnection);
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        let job = chat.send("hello?", &mut seen).unwrap();
        drive(&mut chat, job, &mut seen).await;

        assert!(!chat.is_in_flight());
        assert_eq!(chat.conversation().len(), 2);
        let reply = chat.conversation().last().unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert!(reply.content.starts_with("API call failed: connection failed"));
        assert!(reply.content.contains("connection refused"));
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_partial_text() {
        let partial = content_frame("partial");
        let transport = FakeTransport::new(Script::Chunks(vec![
            Ok(partial.into_bytes()),
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))),
        ]));
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        let job = chat.send("go", &mut seen).unwrap();
        drive(&mut chat, job, &mut seen).await;

        let reply = &chat.conversation().last().unwrap().content;
        assert_eq!(reply, "partial\nAPI call failed: stream read failed: reset by peer");
        assert!(!chat.is_in_flight());
    }

    #[tokio::test]
    async fn done_sentinel_ends_turn_before_close() {
        let a = content_frame("a");
        let b = content_frame("b");
        let transport = FakeTransport::frames(&[&a, "data: [DONE]\n\n", &b]);
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        let job = chat.send("x", &mut seen).unwrap();
        drive(&mut chat, job, &mut seen).await;

        assert_eq!(chat.conversation().last(), Some(&ChatMessage::assistant("a")));
    }

    #[tokio::test]
    async fn empty_stream_commits_empty_reply() {
        let transport = FakeTransport::frames(&[": ping\n\n"]);
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        let job = chat.send("x", &mut seen).unwrap();
        drive(&mut chat, job, &mut seen).await;

        assert_eq!(chat.conversation().last(), Some(&ChatMessage::assistant("")));
        assert_eq!(seen.0.last(), Some(&Seen::Complete(String::new())));
    }

    #[test]
    fn blank_input_is_a_no_op() {
        let transport = FakeTransport::frames(&[]);
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        assert_eq!(chat.send("", &mut seen).err(), Some(SendRejected::Empty));
        assert_eq!(chat.send("   \n\t", &mut seen).err(), Some(SendRejected::Empty));
        assert!(chat.conversation().is_empty());
        assert!(!chat.is_in_flight());
        assert!(seen.0.is_empty());
    }

    #[tokio::test]
    async fn send_while_busy_is_dropped() {
        let ok = content_frame("ok");
        let transport = FakeTransport::frames(&[&ok]);
        let mut chat = orchestrator(transport.clone());
        let mut seen = Recorder::default();

        let first = chat.send("a", &mut seen).unwrap();
        let second = chat.send("b", &mut seen);

        assert_eq!(second.err(), Some(SendRejected::Busy));
        assert_eq!(chat.conversation().messages(), &[ChatMessage::user("a")]);
        assert_eq!(seen.0, vec![Seen::User("a".into())]);

        // only the accepted turn ever reaches the transport
        drive(&mut chat, first, &mut seen).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let sent = transport.last_request.lock().unwrap().take().unwrap();
        assert_eq!(sent.payload.messages, vec![ChatMessage::user("a")]);
        assert_eq!(
            chat.conversation().messages(),
            &[ChatMessage::user("a"), ChatMessage::assistant("ok")]
        );
    }

    #[test]
    fn payload_carries_history_and_bare_model() {
        let transport = FakeTransport::frames(&[]);
        let config = ChatConfig::default()
            .with_api_key("sk-test")
            .with_model("Qwen/Qwen2.5-7B-Instruct")
            .with_system_prompt("be brief");
        let mut chat = ChatOrchestrator::new(config, transport);
        let mut seen = Recorder::default();

        let job = chat.send("  what is rust?  ", &mut seen).unwrap();
        let body = serde_json::to_value(&job.request.payload).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "Qwen/Qwen2.5-7B-Instruct",
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "what is rust?" },
                ],
                "stream": true,
            })
        );
        assert_eq!(job.request.endpoint, "https://api.siliconflow.cn/v1/chat/completions");
        assert!(job
            .request
            .headers
            .contains(&("Authorization".to_string(), "Bearer sk-test".to_string())));
        assert_eq!(chat.current_turn().map(|t| t.prompt().len()), Some(1));
    }

    #[test]
    fn stale_messages_are_ignored() {
        let transport = FakeTransport::frames(&[]);
        let mut chat = orchestrator(transport);
        let mut seen = Recorder::default();

        let job = chat.send("a", &mut seen).unwrap();
        chat.handle(StreamMsg::Delta { turn: TurnId(job.id.0 + 7), text: "zzz".into() }, &mut seen);
        chat.handle(StreamMsg::Delta { turn: job.id, text: "ok".into() }, &mut seen);

        assert_eq!(chat.current_turn().map(Turn::text), Some("ok"));
        chat.handle(StreamMsg::Done { turn: job.id }, &mut seen);
        chat.handle(StreamMsg::Done { turn: job.id }, &mut seen);

        assert_eq!(chat.conversation().len(), 2);
        assert!(!chat.is_in_flight());
    }

    #[tokio::test]
    async fn second_turn_includes_previous_reply() {
        let reply = content_frame("first reply");
        let transport = FakeTransport::frames(&[&reply]);
        let mut chat = orchestrator(transport.clone());
        let mut seen = Recorder::default();

        let job = chat.send("one", &mut seen).unwrap();
        drive(&mut chat, job, &mut seen).await;

        let job = chat.send("two", &mut seen).unwrap();
        let roles: Vec<Role> = job.request.payload.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }
}
