//! Arena turn orchestration.
//!
//! [`TurnOrchestrator`] fires a turn's calls concurrently and funnels their
//! progress into one bounded channel. [`ArenaController`] is the only owner of
//! the [`GameSession`]: commands from the UI and events from the network are
//! applied one at a time in a single `select!` loop, and every change is
//! published as an [`ArenaView`] snapshot.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{complete_json, stream_to_string, ChatTransport};
use crate::config::ArenaMode;
use crate::error::{MouthpieceError, Result};
use crate::levels::{level_by_id, next_level, LevelDefinition};
use crate::prompts;
use crate::providers::ChatRequest;
use crate::relay::sse_deltas;
use crate::session::{
    Channel, ChannelPayload, ChatEntry, GameSession, GameTurnState, JudgeVerdict, Outcome,
    ReviewCard, TurnPhase, TurnTicket,
};

/// Shown in the chat when a turn is rolled back.
pub const FAILURE_NOTICE: &str = "对方掉线了，请重试";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEventKind {
    Payload(ChannelPayload),
    /// A streamed channel reached its end normally.
    ChannelDone(Channel),
    Failed { channel: Channel, error: String },
    /// Both verdict-seeded closing calls finished.
    Final { actor: String, monologue: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEvent {
    pub ticket: TurnTicket,
    pub kind: TurnEventKind,
}

/// The calls that make up one turn.
#[derive(Debug, Clone)]
pub struct TurnRequests {
    pub actor: ChatRequest,
    pub monologue: Option<ChatRequest>,
    pub judge: Option<ChatRequest>,
}

impl TurnRequests {
    pub fn for_mode(
        mode: ArenaMode,
        level: &LevelDefinition,
        history: &[ChatEntry],
        last_mood: i32,
    ) -> Self {
        match mode {
            ArenaMode::ThreeChannel => TurnRequests {
                actor: prompts::actor(level, history, last_mood),
                monologue: Some(prompts::monologue(level, history)),
                judge: Some(prompts::judge(level, history, last_mood)),
            },
            ArenaMode::Combined => TurnRequests {
                actor: prompts::combined_turn(level, history, last_mood),
                monologue: None,
                judge: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TurnOrchestrator
// ---------------------------------------------------------------------------

struct InFlight {
    ticket: TurnTicket,
    /// Cancels everything the turn started.
    turn: CancellationToken,
    /// Child of `turn`; cancelled alone when a game-over verdict makes the
    /// speculative streams moot.
    speculative: CancellationToken,
}

pub struct TurnOrchestrator<T: ?Sized> {
    transport: Arc<T>,
    events: mpsc::Sender<TurnEvent>,
    root: CancellationToken,
    current: Option<InFlight>,
}

impl<T> TurnOrchestrator<T>
where
    T: ChatTransport + ?Sized + 'static,
{
    /// `buffer` bounds the event channel; producers wait when it is full.
    pub fn new(transport: Arc<T>, buffer: usize) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (events, rx) = mpsc::channel(buffer.max(1));
        let orchestrator = TurnOrchestrator {
            transport,
            events,
            root: CancellationToken::new(),
            current: None,
        };
        (orchestrator, rx)
    }

    pub fn current_ticket(&self) -> Option<TurnTicket> {
        self.current.as_ref().map(|c| c.ticket)
    }

    /// Start every call of a turn. Any previous turn is cancelled first.
    pub fn start_turn(&mut self, ticket: TurnTicket, requests: TurnRequests) {
        self.cancel_turn();
        let turn = self.root.child_token();
        let speculative = turn.child_token();

        self.spawn_stream(ticket, Channel::Actor, requests.actor, speculative.clone());
        if let Some(request) = requests.monologue {
            self.spawn_stream(ticket, Channel::Monologue, request, speculative.clone());
        }
        if let Some(request) = requests.judge {
            self.spawn_judge(ticket, request, turn.clone());
        }
        debug!(
            target: "mouthpiece::orchestrator",
            level = ticket.level_id,
            turn = ticket.turn,
            "turn started"
        );
        self.current = Some(InFlight { ticket, turn, speculative });
    }

    /// Drop the speculative streams and request the closing lines.
    pub fn start_final(&mut self, ticket: TurnTicket, actor: ChatRequest, monologue: ChatRequest) {
        let Some(current) = self.current.as_ref().filter(|c| c.ticket == ticket) else {
            debug!(
                target: "mouthpiece::orchestrator",
                turn = ticket.turn,
                "final requested for a turn that is gone"
            );
            return;
        };
        current.speculative.cancel();
        let cancel = current.turn.clone();
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();

        tokio::spawn(async move {
            let actor_call = async {
                stream_to_string(transport.as_ref(), &actor, &cancel)
                    .await
                    .map_err(|e| (Channel::Actor, e))
            };
            let monologue_call = async {
                stream_to_string(transport.as_ref(), &monologue, &cancel)
                    .await
                    .map_err(|e| (Channel::Monologue, e))
            };
            let result = tokio::try_join!(actor_call, monologue_call);
            if cancel.is_cancelled() {
                return;
            }
            let kind = match result {
                Ok(((actor, _), (monologue, _))) => TurnEventKind::Final { actor, monologue },
                Err((channel, e)) => {
                    warn!(
                        target: "mouthpiece::orchestrator",
                        %channel,
                        error = %e,
                        "final call failed"
                    );
                    TurnEventKind::Failed { channel, error: e.to_string() }
                }
            };
            deliver(&events, &cancel, TurnEvent { ticket, kind }).await;
        });
    }

    /// Cancel every in-flight call of the current turn. Nothing from it is
    /// delivered afterwards.
    pub fn cancel_turn(&mut self) {
        if let Some(current) = self.current.take() {
            debug!(
                target: "mouthpiece::orchestrator",
                turn = current.ticket.turn,
                "cancelling turn"
            );
            current.turn.cancel();
        }
    }

    /// Forget a turn that ended on its own.
    pub fn finish_turn(&mut self, ticket: &TurnTicket) {
        if self.current.as_ref().is_some_and(|c| c.ticket == *ticket) {
            self.current = None;
        }
    }

    pub fn shutdown(&mut self) {
        self.current = None;
        self.root.cancel();
    }

    fn spawn_stream(
        &self,
        ticket: TurnTicket,
        channel: Channel,
        request: ChatRequest,
        cancel: CancellationToken,
    ) {
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result =
                forward_stream(transport.as_ref(), &request, channel, ticket, &events, &cancel)
                    .await;
            if cancel.is_cancelled() {
                return;
            }
            let kind = match result {
                Ok(()) => TurnEventKind::ChannelDone(channel),
                Err(e) => {
                    warn!(
                        target: "mouthpiece::orchestrator",
                        %channel,
                        error = %e,
                        "stream failed"
                    );
                    TurnEventKind::Failed { channel, error: e.to_string() }
                }
            };
            deliver(&events, &cancel, TurnEvent { ticket, kind }).await;
        });
    }

    fn spawn_judge(&self, ticket: TurnTicket, request: ChatRequest, cancel: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = complete_json::<T, JudgeVerdict>(transport.as_ref(), &request) => r,
            };
            let kind = match result {
                Ok(verdict) => {
                    info!(
                        target: "mouthpiece::orchestrator",
                        mood = verdict.mood,
                        game_over = verdict.is_game_over,
                        win = verdict.is_win,
                        "judge verdict"
                    );
                    TurnEventKind::Payload(ChannelPayload::JudgeVerdict(verdict))
                }
                Err(e) => {
                    warn!(target: "mouthpiece::orchestrator", error = %e, "judge failed");
                    TurnEventKind::Failed { channel: Channel::Judge, error: e.to_string() }
                }
            };
            deliver(&events, &cancel, TurnEvent { ticket, kind }).await;
        });
    }
}

/// Send unless the turn was cancelled meanwhile. Returns false when the
/// event was not delivered.
async fn deliver(
    events: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
    event: TurnEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn forward_stream<T>(
    transport: &T,
    request: &ChatRequest,
    channel: Channel,
    ticket: TurnTicket,
    events: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
) -> Result<()>
where
    T: ChatTransport + ?Sized,
{
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        opened = transport.open_stream(request) => opened?,
    };
    let mut deltas = Box::pin(sse_deltas(body));
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = deltas.next() => next,
        };
        let text = match next {
            None => return Ok(()),
            Some(item) => item?,
        };
        let payload = match channel {
            Channel::Monologue => ChannelPayload::MonologueDelta(text),
            Channel::Actor | Channel::Judge => ChannelPayload::ActorDelta(text),
        };
        let event = TurnEvent { ticket, kind: TurnEventKind::Payload(payload) };
        if !deliver(events, cancel, event).await {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------------
// ArenaController
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ArenaCommand {
    Send(String),
    SelectLevel(u32),
    NextLevel,
    Retry,
    Shutdown,
}

/// Everything a front end needs to draw the arena.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaView {
    pub level_id: u32,
    pub level_title: &'static str,
    pub opponent_name: &'static str,
    pub history: Vec<ChatEntry>,
    pub state: GameTurnState,
    pub display_mood: i32,
    pub phase: TurnPhase,
    pub typing: bool,
    pub input_enabled: bool,
    pub has_next_level: bool,
    pub last_error: Option<String>,
    pub failed_input: Option<String>,
    pub review: Option<ReviewCard>,
}

impl ArenaView {
    fn of(session: &GameSession) -> Self {
        let level = session.level();
        ArenaView {
            level_id: level.id,
            level_title: level.title,
            opponent_name: level.opponent_name,
            history: session.history().to_vec(),
            state: session.state().clone(),
            display_mood: session.state().display_mood(),
            phase: session.phase(),
            typing: session.is_typing(),
            input_enabled: session.input_enabled(),
            has_next_level: next_level(level.id).is_some(),
            last_error: session.last_error().map(str::to_string),
            failed_input: session.failed_input().map(str::to_string),
            review: session.review_card(),
        }
    }
}

/// Front-end side of a running controller.
#[derive(Clone)]
pub struct ArenaHandle {
    commands: mpsc::Sender<ArenaCommand>,
    view: watch::Receiver<ArenaView>,
}

impl ArenaHandle {
    pub async fn send(&self, command: ArenaCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MouthpieceError::Stream("arena controller has stopped".to_string()))
    }

    pub fn view(&self) -> ArenaView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ArenaView> {
        self.view.clone()
    }

    /// Wait until a published view satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Result<ArenaView>
    where
        F: FnMut(&ArenaView) -> bool,
    {
        self.view
            .wait_for(predicate)
            .await
            .map(|v| (*v).clone())
            .map_err(|_| MouthpieceError::Stream("arena controller has stopped".to_string()))
    }
}

pub struct ArenaController<T: ?Sized> {
    session: GameSession,
    orchestrator: TurnOrchestrator<T>,
    events: mpsc::Receiver<TurnEvent>,
    commands: mpsc::Receiver<ArenaCommand>,
    view: watch::Sender<ArenaView>,
}

impl<T> ArenaController<T>
where
    T: ChatTransport + ?Sized + 'static,
{
    pub fn new(
        transport: Arc<T>,
        level: &'static LevelDefinition,
        mode: ArenaMode,
        buffer: usize,
    ) -> (Self, ArenaHandle) {
        let session = GameSession::new(level, mode);
        let (orchestrator, events) = TurnOrchestrator::new(transport, buffer);
        let (command_tx, commands) = mpsc::channel(16);
        let (view, view_rx) = watch::channel(ArenaView::of(&session));
        let controller = ArenaController { session, orchestrator, events, commands, view };
        (controller, ArenaHandle { commands: command_tx, view: view_rx })
    }

    /// Build a controller and run it on the tokio runtime.
    pub fn spawn(
        transport: Arc<T>,
        level: &'static LevelDefinition,
        mode: ArenaMode,
        buffer: usize,
    ) -> (ArenaHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(transport, level, mode, buffer);
        (handle, tokio::spawn(controller.run()))
    }

    pub async fn run(mut self) {
        info!(
            target: "mouthpiece::orchestrator",
            session = %self.session.id(),
            mode = %self.session.mode(),
            "arena controller started"
        );
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ArenaCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
            self.publish();
        }
        self.orchestrator.shutdown();
        debug!(target: "mouthpiece::orchestrator", "arena controller stopped");
    }

    fn publish(&self) {
        self.view.send_replace(ArenaView::of(&self.session));
    }

    fn handle_command(&mut self, command: ArenaCommand) {
        match command {
            ArenaCommand::Send(text) => {
                let Some(ticket) = self.session.begin_turn(&text) else {
                    debug!(
                        target: "mouthpiece::orchestrator",
                        phase = ?self.session.phase(),
                        "input not accepted"
                    );
                    return;
                };
                let requests = TurnRequests::for_mode(
                    self.session.mode(),
                    self.session.level(),
                    self.session.committed_history(),
                    self.session.state().mood,
                );
                self.orchestrator.start_turn(ticket, requests);
            }
            ArenaCommand::SelectLevel(id) => match level_by_id(id) {
                Some(level) => {
                    self.orchestrator.cancel_turn();
                    self.session.select_level(level);
                }
                None => warn!(target: "mouthpiece::orchestrator", level = id, "unknown level"),
            },
            ArenaCommand::NextLevel => {
                let level = self.session.level();
                let unlocked =
                    self.session.phase() == TurnPhase::Review && self.session.state().is_win;
                match next_level(level.id) {
                    Some(next) if unlocked => {
                        self.orchestrator.cancel_turn();
                        self.session.select_level(next);
                    }
                    _ => debug!(
                        target: "mouthpiece::orchestrator",
                        level = level.id,
                        unlocked,
                        "no next level"
                    ),
                }
            }
            ArenaCommand::Retry => {
                self.orchestrator.cancel_turn();
                self.session.retry();
            }
            ArenaCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: TurnEvent) {
        let ticket = event.ticket;
        let outcome = match event.kind {
            TurnEventKind::Payload(payload) => self.session.apply_payload(&ticket, payload),
            TurnEventKind::ChannelDone(channel) => self.session.complete_channel(&ticket, channel),
            TurnEventKind::Failed { channel, error } => {
                warn!(
                    target: "mouthpiece::orchestrator",
                    %channel,
                    error = %error,
                    "rolling back turn"
                );
                self.session.fail_turn(&ticket, FAILURE_NOTICE)
            }
            TurnEventKind::Final { actor, monologue } => {
                self.session.apply_final(&ticket, &actor, &monologue)
            }
        };

        match outcome {
            Outcome::EnterFinalizing(verdict) => {
                let level = self.session.level();
                let history = self.session.committed_history();
                let actor = prompts::final_actor(level, history, &verdict);
                let monologue = prompts::final_monologue(level, history, &verdict);
                self.orchestrator.start_final(ticket, actor, monologue);
            }
            Outcome::RolledBack => self.orchestrator.cancel_turn(),
            Outcome::TurnComplete | Outcome::Review => self.orchestrator.finish_turn(&ticket),
            Outcome::Ignored(reason) => {
                debug!(
                    target: "mouthpiece::orchestrator",
                    turn = ticket.turn,
                    ?reason,
                    "event ignored"
                );
            }
            Outcome::Updated => {}
        }
    }
}
