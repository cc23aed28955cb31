//! bevy_unillm: a streaming chat client for openai-compatible endpoints.
//!
//! - one conversation, one in-flight turn; sends while busy are dropped.
//! - the response is read off-thread and parsed incrementally; each content
//!   delta becomes a bevy event, in wire order.
//! - never blocks the main thread: turns run on a tiny tokio runtime and
//!   report back through a bounded inbox that a system drains each frame.
//!   only that system mutates the conversation.
//!
//! wire format (chat completions, `stream: true`):
//!   - request:  `{"model": "...", "messages": [{role, content}], "stream": true}`
//!   - response: `data: {"choices":[{"delta":{"content":"..."}}]}` lines,
//!     ended by `data: [DONE]` or the connection closing.

use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

pub mod config;
pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod transport;

pub use config::ChatConfig;
pub use conversation::{ChatMessage, Conversation, Role};
pub use error::{SendRejected, TransportError};
pub use orchestrator::{
    ChatObserver, ChatOrchestrator, CompletionRequest, StreamMsg, Turn, TurnId, TurnJob, run_turn,
};
pub use parser::{StreamEvent, StreamParser};
pub use transport::{ChunkStream, StreamRequest, Transport, UreqTransport};

/// the tokio runtime turns run on. blocking http reads happen on the
/// transport's own threads, so dropping this never waits on a stalled stream.
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_unillm", "UniLlmPlugin: initializing Tokio multi-thread runtime");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum LlmSet {
    /// chat events are emitted here (in `Update`)
    Drain,
}

/// ask for a new turn. ignored when blank or while a turn is streaming.
#[derive(Event, Debug, Clone)]
pub struct SubmitPrompt {
    pub text: String,
}

/// queue a prompt from any system.
pub fn send_user_text(commands: &mut Commands, text: impl Into<String>) {
    let text = text.into();
    debug!(target: "bevy_unillm", "send_user_text (len={})", text.len());
    commands.send_event(SubmitPrompt { text });
}

#[derive(Event, Debug, Clone)]
pub struct ChatStarted {
    pub turn: TurnId,
}
/// the user's message was committed to the conversation.
#[derive(Event, Debug, Clone)]
pub struct UserMessageEvt {
    pub message: ChatMessage,
}
/// incremental assistant text; append it to the streaming bubble.
#[derive(Event, Debug, Clone)]
pub struct ChatDeltaEvt {
    pub text: String,
}
/// the assistant reply was committed; error replies land here too.
#[derive(Event, Debug, Clone)]
pub struct ChatCompletedEvt {
    pub message: ChatMessage,
}

/// cross-thread inbox for streaming; workers send, main thread drains.
/// bounded so a stalled frame pushes back on the worker instead of growing.
#[derive(Resource, Clone)]
pub struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

impl StreamInbox {
    pub fn sender(&self) -> Sender<StreamMsg> {
        self.tx.clone()
    }
}

/// forwards orchestrator callbacks as bevy events.
/// each writer keeps its own system-param lifetime.
struct EventSink<'a, 'u, 'd, 'c> {
    user: &'a mut EventWriter<'u, UserMessageEvt>,
    delta: &'a mut EventWriter<'d, ChatDeltaEvt>,
    done: &'a mut EventWriter<'c, ChatCompletedEvt>,
}

impl ChatObserver for EventSink<'_, '_, '_, '_> {
    fn on_delta(&mut self, text: &str) {
        self.delta.write(ChatDeltaEvt { text: text.to_string() });
    }

    fn on_turn_complete(&mut self, message: &ChatMessage) {
        self.done.write(ChatCompletedEvt { message: message.clone() });
    }

    fn on_user_message_committed(&mut self, message: &ChatMessage) {
        self.user.write(UserMessageEvt { message: message.clone() });
    }
}

/// bevy plugin: wires systems, events, resources.
/// uses an inserted `ChatOrchestrator` if present, otherwise builds one from
/// `ChatConfig::from_env()` with the ureq transport.
pub struct UniLlmPlugin;

impl Plugin for UniLlmPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_unillm", "UniLlmPlugin: build()");
        app.init_resource::<StreamInbox>()
            .add_event::<SubmitPrompt>()
            .add_event::<ChatStarted>()
            .add_event::<UserMessageEvt>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .configure_sets(Update, LlmSet::Drain)
            .add_systems(Update, spawn_chat_requests.before(LlmSet::Drain))
            .add_systems(Update, drain_stream_inbox.in_set(LlmSet::Drain));

        if !app.world().contains_resource::<ChatOrchestrator>() {
            let config = ChatConfig::from_env();
            if config.api_key.is_empty() {
                warn!(target: "bevy_unillm", "OPENAI_API_KEY is empty; requests will likely be rejected");
            }
            info!(target: "bevy_unillm", "endpoint={} model={}", config.endpoint(), config.model);
            app.insert_resource(ChatOrchestrator::new(config, Arc::new(UreqTransport::new())));
        }
        if !app.world().contains_resource::<TokioRt>() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// starts a turn for each submitted prompt the orchestrator accepts.
fn spawn_chat_requests(
    mut prompts: EventReader<SubmitPrompt>,
    mut chat: ResMut<ChatOrchestrator>,
    inbox: Res<StreamInbox>,
    rt: Res<TokioRt>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_user: EventWriter<UserMessageEvt>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
) {
    for SubmitPrompt { text } in prompts.read() {
        let mut sink = EventSink { user: &mut ev_user, delta: &mut ev_delta, done: &mut ev_done };
        match chat.send(text, &mut sink) {
            Ok(job) => {
                ev_start.write(ChatStarted { turn: job.id });
                rt.0.spawn(run_turn(job, inbox.sender()));
            }
            Err(rejected) => {
                debug!(target: "bevy_unillm", "prompt ignored: {}", rejected);
            }
        }
    }
}

/// drains the inbox into the orchestrator, which emits the chat events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut chat: ResMut<ChatOrchestrator>,
    mut ev_user: EventWriter<UserMessageEvt>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
) {
    // cap per frame to avoid long frames on bursty streams; the rest waits in order
    const MAX_PER_FRAME: usize = 512;
    let mut sink = EventSink { user: &mut ev_user, delta: &mut ev_delta, done: &mut ev_done };
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(msg) => chat.handle(msg, &mut sink),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
}
