//! Arena game session: chat history, turn state, and the guards that keep
//! late or duplicate results from touching it.
//!
//! Every mutation that originates from a network call carries the
//! [`TurnTicket`] it was issued under. A ticket stops being current when the
//! level changes, the level is retried, or the turn is rolled back; results
//! under a stale ticket are dropped without touching anything. A game-over
//! verdict sets a latch for the rest of the level session so a duplicate
//! verdict can never append a second review card or move the mood again.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::bubbles::{finalize_bubbles, join_bubbles, segment_bubbles};
use crate::config::ArenaMode;
use crate::envelope::EnvelopeSplitter;
use crate::levels::LevelDefinition;

// ---------------------------------------------------------------------------
// Chat history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Ai,
    User,
    System,
}

/// Sub-kinds of system entries, told apart by a text prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    MissionBrief,
    Notification,
    ReviewCard,
}

impl SystemKind {
    const ALL: [SystemKind; 3] = [
        SystemKind::MissionBrief,
        SystemKind::Notification,
        SystemKind::ReviewCard,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            SystemKind::MissionBrief => "[任务]",
            SystemKind::Notification => "[通知]",
            SystemKind::ReviewCard => "[复盘]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender: Sender,
    pub text: String,
}

impl ChatEntry {
    pub fn ai(text: impl Into<String>) -> Self {
        ChatEntry { sender: Sender::Ai, text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        ChatEntry { sender: Sender::User, text: text.into() }
    }

    pub fn system(kind: SystemKind, body: &str) -> Self {
        ChatEntry { sender: Sender::System, text: format!("{}{}", kind.prefix(), body) }
    }

    pub fn system_kind(&self) -> Option<SystemKind> {
        if self.sender != Sender::System {
            return None;
        }
        SystemKind::ALL.into_iter().find(|k| self.text.starts_with(k.prefix()))
    }

    /// Text without the system prefix.
    pub fn body(&self) -> &str {
        match self.system_kind() {
            Some(kind) => &self.text[kind.prefix().len()..],
            None => &self.text,
        }
    }

    pub fn review_card(&self) -> Option<ReviewCard> {
        match self.system_kind() {
            Some(SystemKind::ReviewCard) => serde_json::from_str(self.body()).ok(),
            _ => None,
        }
    }
}

/// End-of-level summary shown after a game-over turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCard {
    pub is_win: bool,
    pub mood: i32,
    pub inner_monologue: String,
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funny_reaction: Option<String>,
    /// The closing dialogue, bubbles joined by spaces.
    pub final_reply: String,
}

// ---------------------------------------------------------------------------
// Channel payloads
// ---------------------------------------------------------------------------

fn mood_from_value(value: &Value) -> Option<i32> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(raw.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}

fn lenient_mood<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
    let value = Value::deserialize(d)?;
    mood_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("mood is not a number: {value}")))
}

fn lenient_mood_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(mood_from_value))
}

/// The judge's decision for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeVerdict {
    #[serde(deserialize_with = "lenient_mood")]
    pub mood: i32,
    #[serde(default)]
    pub is_game_over: bool,
    #[serde(default)]
    pub is_win: bool,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub funny_reaction: Option<String>,
}

/// Header of the actor envelope. All fields are optional; the three-channel
/// mode only reads mood and inner thoughts from it, the combined mode reads
/// the whole verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActorMetadata {
    #[serde(deserialize_with = "lenient_mood_opt")]
    pub mood: Option<i32>,
    #[serde(rename = "innerOS", alias = "innerOs", alias = "innerMonologue")]
    pub inner_os: Option<String>,
    pub is_game_over: Option<bool>,
    pub is_win: Option<bool>,
    pub score: Option<i32>,
    pub analysis: Option<String>,
    pub funny_reaction: Option<String>,
}

impl ActorMetadata {
    pub fn into_verdict(self, fallback_mood: i32) -> JudgeVerdict {
        JudgeVerdict {
            mood: self.mood.unwrap_or(fallback_mood),
            is_game_over: self.is_game_over.unwrap_or(false),
            is_win: self.is_win.unwrap_or(false),
            analysis: self.analysis.unwrap_or_default(),
            funny_reaction: self.funny_reaction,
        }
    }
}

/// A validated result from one of a turn's calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    ActorDelta(String),
    MonologueDelta(String),
    JudgeVerdict(JudgeVerdict),
}

// ---------------------------------------------------------------------------
// Turn state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameTurnState {
    /// As reported upstream; may leave [0, 100].
    pub mood: i32,
    pub inner_monologue: String,
    pub is_game_over: bool,
    pub is_win: bool,
    pub analysis: String,
    pub funny_reaction: Option<String>,
}

impl GameTurnState {
    fn initial(level: &LevelDefinition) -> Self {
        GameTurnState {
            mood: level.initial_mood,
            inner_monologue: format!("（{}正在等待你的回复...）", level.opponent_name),
            is_game_over: false,
            is_win: false,
            analysis: String::new(),
            funny_reaction: None,
        }
    }

    pub fn display_mood(&self) -> i32 {
        self.mood.clamp(0, 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingInput,
    Streaming,
    Finalizing,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Actor,
    Monologue,
    Judge,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Actor => write!(f, "actor"),
            Channel::Monologue => write!(f, "monologue"),
            Channel::Judge => write!(f, "judge"),
        }
    }
}

/// Identity of one in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnTicket {
    pub level_id: u32,
    pub epoch: u64,
    pub turn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Issued under a level, retry or turn that is no longer current.
    Stale,
    /// A game-over verdict was already accepted for this level session.
    Latched,
    /// Arrived in a phase that no longer accepts it.
    WrongPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Updated,
    /// Every channel finished and the game goes on.
    TurnComplete,
    /// The judge declared game over; the closing lines must be re-requested.
    EnterFinalizing(JudgeVerdict),
    /// The review card was committed; input stays disabled.
    Review,
    RolledBack,
    Ignored(IgnoreReason),
}

impl Outcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Outcome::Ignored(_))
    }
}

#[derive(Debug, Clone)]
struct TurnProgress {
    actor: EnvelopeSplitter,
    monologue: String,
    actor_done: bool,
    monologue_done: bool,
    judge_done: bool,
    history_before: Vec<ChatEntry>,
    state_before: GameTurnState,
    user_text: String,
}

// ---------------------------------------------------------------------------
// GameSession
// ---------------------------------------------------------------------------

pub struct GameSession {
    id: Uuid,
    mode: ArenaMode,
    level: &'static LevelDefinition,
    epoch: u64,
    turn_seq: u64,
    history: Vec<ChatEntry>,
    state: GameTurnState,
    phase: TurnPhase,
    game_over_latched: bool,
    /// Index in `history` where the current turn's AI bubbles start.
    turn_base: usize,
    progress: Option<TurnProgress>,
    last_error: Option<String>,
    failed_input: Option<String>,
}

impl GameSession {
    pub fn new(level: &'static LevelDefinition, mode: ArenaMode) -> Self {
        let mut session = GameSession {
            id: Uuid::new_v4(),
            mode,
            level,
            epoch: 0,
            turn_seq: 0,
            history: Vec::new(),
            state: GameTurnState::initial(level),
            phase: TurnPhase::AwaitingInput,
            game_over_latched: false,
            turn_base: 0,
            progress: None,
            last_error: None,
            failed_input: None,
        };
        session.reset(level);
        session
    }

    fn reset(&mut self, level: &'static LevelDefinition) {
        self.level = level;
        self.epoch += 1;
        let brief = ChatEntry::system(SystemKind::MissionBrief, level.background);
        self.history = std::iter::once(brief)
            .chain(level.opening_bubbles().into_iter().map(ChatEntry::ai))
            .collect();
        self.state = GameTurnState::initial(level);
        self.phase = TurnPhase::AwaitingInput;
        self.game_over_latched = false;
        self.turn_base = self.history.len();
        self.progress = None;
        self.last_error = None;
        self.failed_input = None;
        debug!(
            target: "mouthpiece::session",
            session = %self.id,
            level = level.id,
            epoch = self.epoch,
            "level session started"
        );
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> ArenaMode {
        self.mode
    }

    pub fn level(&self) -> &'static LevelDefinition {
        self.level
    }

    pub fn history(&self) -> &[ChatEntry] {
        &self.history
    }

    pub fn state(&self) -> &GameTurnState {
        &self.state
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_latched(&self) -> bool {
        self.game_over_latched
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.phase, TurnPhase::Streaming | TurnPhase::Finalizing)
    }

    pub fn input_enabled(&self) -> bool {
        self.phase == TurnPhase::AwaitingInput && !self.game_over_latched
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn failed_input(&self) -> Option<&str> {
        self.failed_input.as_deref()
    }

    /// Text of a turn that was rolled back, for the input box to offer again.
    pub fn take_failed_input(&mut self) -> Option<String> {
        self.failed_input.take()
    }

    pub fn review_card(&self) -> Option<ReviewCard> {
        self.history.iter().rev().find_map(ChatEntry::review_card)
    }

    /// History as sent to the model: everything except the current turn's
    /// in-progress bubbles.
    pub fn committed_history(&self) -> &[ChatEntry] {
        match self.phase {
            TurnPhase::Streaming | TurnPhase::Finalizing => &self.history[..self.turn_base],
            TurnPhase::AwaitingInput | TurnPhase::Review => &self.history,
        }
    }

    pub fn is_current(&self, ticket: &TurnTicket) -> bool {
        ticket.level_id == self.level.id
            && ticket.epoch == self.epoch
            && ticket.turn == self.turn_seq
    }

    // -- level navigation ---------------------------------------------------

    pub fn select_level(&mut self, level: &'static LevelDefinition) {
        self.reset(level);
    }

    pub fn retry(&mut self) {
        self.reset(self.level);
    }

    // -- turn lifecycle -----------------------------------------------------

    /// Record the user's message and open a turn. `None` when input is not
    /// accepted right now or the message is blank.
    pub fn begin_turn(&mut self, text: &str) -> Option<TurnTicket> {
        let text = text.trim();
        if text.is_empty() || !self.input_enabled() {
            return None;
        }
        let history_before = self.history.clone();
        let state_before = self.state.clone();

        self.history.push(ChatEntry::user(text));
        self.turn_base = self.history.len();
        self.turn_seq += 1;
        self.phase = TurnPhase::Streaming;
        self.last_error = None;
        self.failed_input = None;
        self.state.inner_monologue = "（...".to_string();
        self.progress = Some(TurnProgress {
            actor: EnvelopeSplitter::new(),
            monologue: String::new(),
            actor_done: false,
            monologue_done: self.mode == ArenaMode::Combined,
            judge_done: false,
            history_before,
            state_before,
            user_text: text.to_string(),
        });
        self.render_streaming();

        Some(TurnTicket { level_id: self.level.id, epoch: self.epoch, turn: self.turn_seq })
    }

    fn check(&self, ticket: &TurnTicket, what: &str) -> Option<IgnoreReason> {
        if self.is_current(ticket) {
            return None;
        }
        debug!(
            target: "mouthpiece::session",
            session = %self.id,
            ticket_level = ticket.level_id,
            ticket_turn = ticket.turn,
            what,
            "discarding stale result"
        );
        Some(IgnoreReason::Stale)
    }

    pub fn apply_actor_text(&mut self, ticket: &TurnTicket, chunk: &str) -> Outcome {
        if let Some(reason) = self.check(ticket, "actor chunk") {
            return Outcome::Ignored(reason);
        }
        if self.phase != TurnPhase::Streaming {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let Some(progress) = self.progress.as_mut() else {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        };

        let newly_latched = progress.actor.push(chunk);
        let metadata = if newly_latched {
            progress.actor.metadata_as::<ActorMetadata>()
        } else {
            None
        };
        let judge_done = progress.judge_done;
        let monologue_empty = progress.monologue.trim().is_empty();

        if let Some(meta) = metadata {
            match self.mode {
                ArenaMode::ThreeChannel => {
                    // Optimistic until the judge speaks.
                    if let (Some(mood), false) = (meta.mood, judge_done) {
                        self.state.mood = mood;
                    }
                    if let (Some(os), true) = (meta.inner_os.as_deref(), monologue_empty) {
                        self.state.inner_monologue = os.trim().to_string();
                    }
                }
                ArenaMode::Combined => {
                    if let Some(os) = meta.inner_os.as_deref() {
                        self.state.inner_monologue = os.trim().to_string();
                    }
                    let verdict = meta.into_verdict(self.state.mood);
                    self.render_streaming();
                    return self.apply_verdict(ticket, verdict);
                }
            }
        }

        self.render_streaming();
        Outcome::Updated
    }

    pub fn apply_monologue_text(&mut self, ticket: &TurnTicket, chunk: &str) -> Outcome {
        if let Some(reason) = self.check(ticket, "monologue chunk") {
            return Outcome::Ignored(reason);
        }
        if self.phase != TurnPhase::Streaming {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let Some(progress) = self.progress.as_mut() else {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        };
        progress.monologue.push_str(chunk);
        let text = progress.monologue.trim();
        if !text.is_empty() {
            self.state.inner_monologue = text.to_string();
        }
        Outcome::Updated
    }

    /// A streamed channel ended normally.
    pub fn complete_channel(&mut self, ticket: &TurnTicket, channel: Channel) -> Outcome {
        if let Some(reason) = self.check(ticket, "channel done") {
            return Outcome::Ignored(reason);
        }
        if self.phase != TurnPhase::Streaming {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let Some(progress) = self.progress.as_mut() else {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        };
        match channel {
            Channel::Actor => {
                progress.actor_done = true;
                // No envelope header in the combined reply means no verdict.
                if self.mode == ArenaMode::Combined {
                    progress.judge_done = true;
                }
            }
            Channel::Monologue => progress.monologue_done = true,
            Channel::Judge => progress.judge_done = true,
        }
        self.try_complete()
    }

    pub fn apply_verdict(&mut self, ticket: &TurnTicket, verdict: JudgeVerdict) -> Outcome {
        if let Some(reason) = self.check(ticket, "judge verdict") {
            return Outcome::Ignored(reason);
        }
        if self.game_over_latched {
            debug!(
                target: "mouthpiece::session",
                session = %self.id,
                "ignoring verdict after game over"
            );
            return Outcome::Ignored(IgnoreReason::Latched);
        }
        if self.phase != TurnPhase::Streaming {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let Some(progress) = self.progress.as_mut() else {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        };
        progress.judge_done = true;

        self.state.mood = verdict.mood;
        self.state.is_game_over = verdict.is_game_over;
        self.state.is_win = verdict.is_win;
        self.state.analysis = verdict.analysis.clone();
        self.state.funny_reaction = verdict.funny_reaction.clone();

        if !verdict.is_game_over {
            return self.try_complete();
        }

        self.game_over_latched = true;
        match self.mode {
            ArenaMode::ThreeChannel => {
                self.phase = TurnPhase::Finalizing;
                Outcome::EnterFinalizing(verdict)
            }
            // The streamed dialogue already knows the outcome; let it finish.
            ArenaMode::Combined => self.try_complete(),
        }
    }

    /// Route a payload to the matching `apply_*` operation.
    pub fn apply_payload(&mut self, ticket: &TurnTicket, payload: ChannelPayload) -> Outcome {
        match payload {
            ChannelPayload::ActorDelta(text) => self.apply_actor_text(ticket, &text),
            ChannelPayload::MonologueDelta(text) => self.apply_monologue_text(ticket, &text),
            ChannelPayload::JudgeVerdict(verdict) => self.apply_verdict(ticket, verdict),
        }
    }

    /// The verdict-seeded closing lines arrived.
    pub fn apply_final(
        &mut self,
        ticket: &TurnTicket,
        actor_text: &str,
        monologue: &str,
    ) -> Outcome {
        if let Some(reason) = self.check(ticket, "final pair") {
            return Outcome::Ignored(reason);
        }
        if self.phase != TurnPhase::Finalizing {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let mut actor = EnvelopeSplitter::new();
        actor.push(actor_text);
        let dialogue = actor.finish().dialogue_text;
        let monologue = monologue.trim();
        if !monologue.is_empty() {
            self.state.inner_monologue = monologue.to_string();
        }
        self.commit_review(&dialogue)
    }

    /// Roll a failed turn back to the moment before the user's message.
    pub fn fail_turn(&mut self, ticket: &TurnTicket, reason: &str) -> Outcome {
        if let Some(reason) = self.check(ticket, "failure") {
            return Outcome::Ignored(reason);
        }
        if !self.is_typing() {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        }
        let Some(progress) = self.progress.take() else {
            return Outcome::Ignored(IgnoreReason::WrongPhase);
        };
        self.history = progress.history_before;
        self.history.push(ChatEntry::system(SystemKind::Notification, reason));
        self.state = progress.state_before;
        self.turn_base = self.history.len();
        self.game_over_latched = false;
        self.phase = TurnPhase::AwaitingInput;
        self.last_error = Some(reason.to_string());
        self.failed_input = Some(progress.user_text);
        // Retire the ticket so nothing else from this turn lands.
        self.turn_seq += 1;
        Outcome::RolledBack
    }

    // -- internals ----------------------------------------------------------

    fn render_streaming(&mut self) {
        let Some(progress) = self.progress.as_ref() else {
            return;
        };
        let bubbles = segment_bubbles(progress.actor.dialogue_text());
        self.history.truncate(self.turn_base);
        self.history.extend(bubbles.into_iter().map(ChatEntry::ai));
    }

    fn try_complete(&mut self) -> Outcome {
        let Some(progress) = self.progress.as_ref() else {
            return Outcome::Updated;
        };
        if !(progress.actor_done && progress.monologue_done && progress.judge_done) {
            return Outcome::Updated;
        }
        let dialogue = progress.actor.finish().dialogue_text;
        if self.game_over_latched {
            return self.commit_review(&dialogue);
        }

        self.history.truncate(self.turn_base);
        self.history.extend(finalize_bubbles(&dialogue).into_iter().map(ChatEntry::ai));
        self.turn_base = self.history.len();
        self.progress = None;
        self.phase = TurnPhase::AwaitingInput;
        Outcome::TurnComplete
    }

    fn commit_review(&mut self, dialogue: &str) -> Outcome {
        let bubbles = finalize_bubbles(dialogue);
        let card = ReviewCard {
            is_win: self.state.is_win,
            mood: self.state.mood,
            inner_monologue: self.state.inner_monologue.clone(),
            analysis: self.state.analysis.clone(),
            funny_reaction: self.state.funny_reaction.clone(),
            final_reply: join_bubbles(&bubbles),
        };

        self.history.truncate(self.turn_base);
        self.history.extend(bubbles.into_iter().map(ChatEntry::ai));
        if let Some(reaction) = card.funny_reaction.as_deref().filter(|r| !r.trim().is_empty()) {
            self.history.push(ChatEntry::system(SystemKind::Notification, reaction));
        }
        let body = serde_json::to_string(&card).unwrap_or_default();
        self.history.push(ChatEntry::system(SystemKind::ReviewCard, &body));
        self.turn_base = self.history.len();
        self.progress = None;
        self.phase = TurnPhase::Review;
        Outcome::Review
    }
}
