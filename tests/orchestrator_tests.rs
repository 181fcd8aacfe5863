//! Arena controller tests over a scripted transport: turn commit, game-over
//! re-issue, once-only review, rollback, level changes and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use common::{CallKind, Reply, ScriptedTransport, LOST, NOT_OVER, WON};
use mouthpiece::config::ArenaMode;
use mouthpiece::levels::level_by_id;
use mouthpiece::orchestrator::{
    ArenaCommand, ArenaController, ArenaHandle, ArenaView, TurnEventKind, TurnOrchestrator,
    TurnRequests, FAILURE_NOTICE,
};
use mouthpiece::prompts;
use mouthpiece::session::{
    Channel, ChannelPayload, ChatEntry, JudgeVerdict, Sender, SystemKind, TurnPhase, TurnTicket,
};

const WAIT: Duration = Duration::from_secs(5);

fn spawn_arena(
    transport: &Arc<ScriptedTransport>,
    level_id: u32,
) -> (ArenaHandle, JoinHandle<()>) {
    let level = level_by_id(level_id).unwrap();
    ArenaController::spawn(Arc::clone(transport), level, ArenaMode::ThreeChannel, 8)
}

fn three_channel(history: &[ChatEntry]) -> TurnRequests {
    TurnRequests::for_mode(ArenaMode::ThreeChannel, level_by_id(1).unwrap(), history, 60)
}

async fn wait(handle: &mut ArenaHandle, predicate: impl FnMut(&ArenaView) -> bool) -> ArenaView {
    timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("view never reached the expected state")
        .expect("controller stopped")
}

fn ai_after_user(view: &ArenaView) -> Vec<String> {
    let start = view
        .history
        .iter()
        .rposition(|e| e.sender == Sender::User)
        .map(|i| i + 1)
        .unwrap_or(0);
    view.history[start..]
        .iter()
        .filter(|e| e.sender == Sender::Ai)
        .map(|e| e.text.clone())
        .collect()
}

fn review_cards(view: &ArenaView) -> usize {
    view.history
        .iter()
        .filter(|e| e.system_kind() == Some(SystemKind::ReviewCard))
        .count()
}

fn has_user(view: &ArenaView) -> bool {
    view.history.iter().any(|e| e.sender == Sender::User)
}

#[tokio::test]
async fn test_turn_commits_bubbles_monologue_and_judge_mood() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Actor => Reply::deltas(&[
            "###DATA###{\"mood\":",
            " 58, \"innerOS\":\"烦\"}###TEXT###",
            "行吧|",
            "||我转你",
        ]),
        CallKind::Monologue => Reply::deltas(&["这人", "真抠"]),
        CallKind::Judge => Reply::json(NOT_OVER),
        _ => Reply::Status(500),
    });
    let level = level_by_id(1).unwrap();
    let (mut handle, _task) =
        ArenaController::spawn(transport.clone(), level, ArenaMode::ThreeChannel, 8);

    handle.send(ArenaCommand::Send("先转钱再说".into())).await.unwrap();
    let view = wait(&mut handle, |v| has_user(v) && v.phase == TurnPhase::AwaitingInput).await;

    assert_eq!(ai_after_user(&view), vec!["行吧", "我转你"]);
    assert_eq!(view.state.mood, 62);
    assert_eq!(view.state.inner_monologue, "这人真抠");
    assert!(view.input_enabled);
    assert_eq!(transport.count(CallKind::Judge), 1);
    assert_eq!(transport.count(CallKind::FinalActor), 0);
}

#[tokio::test]
async fn test_history_sent_to_model_excludes_system_entries() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Judge => Reply::json(NOT_OVER),
        _ => Reply::deltas(&["###DATA###{}###TEXT###嗯"]),
    });
    let (mut handle, _task) = spawn_arena(&transport, 1);
    handle.send(ArenaCommand::Send("你好".into())).await.unwrap();
    wait(&mut handle, |v| has_user(v) && !v.typing).await;

    let (_, actor) = transport
        .calls()
        .into_iter()
        .find(|(k, _)| *k == CallKind::Actor)
        .expect("actor call");
    // system prompt + three opening bubbles + the user message
    assert_eq!(actor.messages.len(), 5);
    assert!(!actor.messages.iter().any(|m| m.content.contains("[任务]")));
    assert_eq!(actor.messages.last().unwrap().content, "你好");
}

#[tokio::test]
async fn test_game_over_reissues_and_replaces_speculative_dialogue() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Actor => Reply::Hang(vec!["###DATA###{}###TEXT###好的马上转".into()]),
        CallKind::Monologue => Reply::Hang(vec!["真好骗".into()]),
        CallKind::Judge => Reply::json(LOST),
        CallKind::FinalActor => Reply::deltas(&["###DATA###{}###TEXT###", "拉黑了|||别找我"]),
        CallKind::FinalMonologue => Reply::deltas(&["冤大头"]),
    });
    let (mut handle, _task) = spawn_arena(&transport, 1);

    handle.send(ArenaCommand::Send("算了我请你".into())).await.unwrap();
    let view = wait(&mut handle, |v| v.review.is_some()).await;

    assert_eq!(ai_after_user(&view), vec!["拉黑了", "别找我"]);
    assert!(!view.history.iter().any(|e| e.text.contains("好的马上转")));
    assert_eq!(review_cards(&view), 1);
    let notice = view
        .history
        .iter()
        .find(|e| e.system_kind() == Some(SystemKind::Notification))
        .map(ChatEntry::body);
    assert_eq!(notice, Some("大刘把你拉黑了"));

    let card = view.review.unwrap();
    assert!(!card.is_win);
    assert_eq!(card.mood, 4);
    assert_eq!(card.inner_monologue, "冤大头");
    assert!(!view.input_enabled);
    assert_eq!(view.phase, TurnPhase::Review);
    assert_eq!(transport.count(CallKind::FinalActor), 1);
    assert_eq!(transport.count(CallKind::FinalMonologue), 1);
}

#[tokio::test]
async fn test_input_after_game_over_is_refused() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Judge => Reply::json(WON),
        _ => Reply::deltas(&["###DATA###{}###TEXT###给你给你"]),
    });
    let (mut handle, _task) = spawn_arena(&transport, 1);
    handle.send(ArenaCommand::Send("转我".into())).await.unwrap();
    let first = wait(&mut handle, |v| v.review.is_some()).await;

    handle.send(ArenaCommand::Send("再聊聊".into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = handle.view();

    assert_eq!(after.history, first.history);
    assert_eq!(review_cards(&after), 1);
    assert_eq!(transport.count(CallKind::Judge), 1);
    assert_eq!(after.state.mood, 70);
}

#[tokio::test]
async fn test_failure_rolls_back_and_offers_input_again() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Actor => Reply::Hang(vec!["###DATA###{\"mood\": 1}###TEXT###半句".into()]),
        CallKind::Monologue => Reply::Hang(vec![]),
        CallKind::Judge => Reply::Status(502),
        _ => Reply::Status(500),
    });
    let (mut handle, _task) = spawn_arena(&transport, 1);
    let initial = handle.view();

    handle.send(ArenaCommand::Send("在吗".into())).await.unwrap();
    let view = wait(&mut handle, |v| v.last_error.is_some()).await;

    assert_eq!(&view.history[..initial.history.len()], initial.history.as_slice());
    assert_eq!(view.history.len(), initial.history.len() + 1);
    assert_eq!(view.history.last().unwrap().body(), FAILURE_NOTICE);
    assert_eq!(view.state.mood, initial.state.mood);
    assert_eq!(view.failed_input.as_deref(), Some("在吗"));
    assert!(view.input_enabled);
    assert!(!view.typing);

    // Late deltas from the abandoned streams change nothing.
    transport.push_all("|||迟到的话").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.view().history, view.history);
}

#[tokio::test]
async fn test_level_switch_drops_pending_results() {
    let gate = Arc::new(Notify::new());
    let judge_gate = Arc::clone(&gate);
    let transport = ScriptedTransport::new(move |kind, _| match kind {
        CallKind::Judge => Reply::gated(&judge_gate, Reply::json(LOST)),
        _ => Reply::deltas(&["###DATA###{\"mood\": 0}###TEXT###滚"]),
    });
    let (mut handle, _task) = spawn_arena(&transport, 1);

    handle.send(ArenaCommand::Send("你先转".into())).await.unwrap();
    wait(&mut handle, |v| v.typing).await;

    handle.send(ArenaCommand::SelectLevel(2)).await.unwrap();
    let switched = wait(&mut handle, |v| v.level_id == 2).await;
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = handle.view();
    assert_eq!(view.level_id, 2);
    assert_eq!(view.state.mood, 50);
    assert_eq!(view.history, switched.history);
    assert!(view.review.is_none());
    assert!(!has_user(&view));
    assert!(view.input_enabled);
}

#[tokio::test]
async fn test_retry_resets_level_mid_turn() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::Judge => Reply::gated(&Arc::new(Notify::new()), Reply::json(NOT_OVER)),
        _ => Reply::Hang(vec![]),
    });
    let (mut handle, _task) = spawn_arena(&transport, 3);
    let initial = handle.view();

    handle.send(ArenaCommand::Send("不是我的锅".into())).await.unwrap();
    wait(&mut handle, |v| v.typing).await;
    handle.send(ArenaCommand::Retry).await.unwrap();
    let view = wait(&mut handle, |v| !v.typing).await;

    assert_eq!(view.history, initial.history);
    assert_eq!(view.state, initial.state);
    assert!(view.input_enabled);
}

#[tokio::test]
async fn test_combined_mode_win_unlocks_next_level() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        // Combined turns share the monologue temperature.
        CallKind::Monologue => Reply::deltas(&[
            "###DATA###{\"mood\":70,\"innerOS\":\"算了\",\"isGameOver\":true,",
            "\"isWin\":true,\"analysis\":\"稳\"}###TEXT###",
            "转你了|||下次别找我",
        ]),
        _ => Reply::Status(500),
    });
    let (mut handle, _task) =
        ArenaController::spawn(transport.clone(), level_by_id(1).unwrap(), ArenaMode::Combined, 8);

    handle.send(ArenaCommand::Send("奶茶钱转我".into())).await.unwrap();
    let view = wait(&mut handle, |v| v.review.is_some()).await;

    let card = view.review.clone().unwrap();
    assert!(card.is_win);
    assert_eq!(card.final_reply, "转你了 下次别找我");
    assert_eq!(view.state.inner_monologue, "算了");
    assert!(view.has_next_level);
    assert_eq!(transport.count(CallKind::Judge), 0);
    assert_eq!(transport.count(CallKind::FinalActor), 0);

    handle.send(ArenaCommand::NextLevel).await.unwrap();
    let next = wait(&mut handle, |v| v.level_id == 2).await;
    assert_eq!(next.phase, TurnPhase::AwaitingInput);
    assert!(next.review.is_none());
}

#[tokio::test]
async fn test_next_level_locked_until_win() {
    let transport = ScriptedTransport::new(|_, _| Reply::Status(500));
    let (handle, _task) =
        ArenaController::spawn(transport, level_by_id(1).unwrap(), ArenaMode::ThreeChannel, 8);
    handle.send(ArenaCommand::NextLevel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.view().level_id, 1);
}

#[tokio::test]
async fn test_cancelled_turn_delivers_nothing_more() {
    let gate = Arc::new(Notify::new());
    let judge_gate = Arc::clone(&gate);
    let transport = ScriptedTransport::new(move |kind, _| match kind {
        CallKind::Judge => Reply::gated(&judge_gate, Reply::json(NOT_OVER)),
        _ => Reply::Hang(vec!["first".into()]),
    });
    let (mut orchestrator, mut events) = TurnOrchestrator::new(transport.clone(), 4);
    let ticket = TurnTicket { level_id: 1, epoch: 1, turn: 1 };
    let history = vec![ChatEntry::user("hi")];
    orchestrator.start_turn(ticket, three_channel(&history));

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(first.ticket, ticket);

    orchestrator.cancel_turn();
    assert!(orchestrator.current_ticket().is_none());
    gate.notify_one();
    transport.push_all("second").await;

    let mut late = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        late.push(event.kind);
    }
    assert!(!late
        .iter()
        .any(|k| matches!(k, TurnEventKind::Payload(ChannelPayload::JudgeVerdict(_)))));
    assert!(!late.iter().any(|k| {
        matches!(k, TurnEventKind::Payload(ChannelPayload::ActorDelta(t)) if t == "second")
    }));
    assert!(!late.iter().any(|k| matches!(k, TurnEventKind::ChannelDone(_))));
}

#[tokio::test]
async fn test_new_turn_silences_previous_open_stream() {
    let gate = Arc::new(Notify::new());
    let judge_gate = Arc::clone(&gate);
    let transport = ScriptedTransport::new(move |kind, _| match kind {
        CallKind::Judge => Reply::gated(&judge_gate, Reply::json(NOT_OVER)),
        _ => Reply::Hang(vec!["first".into()]),
    });
    let (mut orchestrator, mut events) = TurnOrchestrator::new(transport.clone(), 8);
    let history = vec![ChatEntry::user("hi")];
    let old = TurnTicket { level_id: 1, epoch: 1, turn: 1 };
    orchestrator.start_turn(old, three_channel(&history));

    // One opening delta each from the actor and monologue streams.
    for _ in 0..2 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.ticket, old);
    }

    let new = TurnTicket { level_id: 1, epoch: 1, turn: 2 };
    orchestrator.start_turn(new, three_channel(&history));
    assert_eq!(orchestrator.current_ticket(), Some(new));
    transport.push_all("second").await;
    gate.notify_waiters();

    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(150), events.recv()).await {
        seen.push(event);
    }
    assert!(seen.iter().all(|e| e.ticket != old), "old turn delivered after a new one started");
    assert!(seen.iter().any(|e| e.ticket == new));
}

#[tokio::test]
async fn test_final_failure_names_the_failing_channel() {
    let transport = ScriptedTransport::new(|kind, _| match kind {
        CallKind::FinalActor => Reply::deltas(&["算你狠"]),
        CallKind::FinalMonologue => Reply::Status(500),
        CallKind::Judge => Reply::Gated(Arc::new(Notify::new()), Box::new(Reply::json(LOST))),
        _ => Reply::Hang(Vec::new()),
    });
    let (mut orchestrator, mut events) = TurnOrchestrator::new(transport.clone(), 8);
    let level = level_by_id(1).unwrap();
    let history = vec![ChatEntry::user("hi")];
    let ticket = TurnTicket { level_id: 1, epoch: 1, turn: 1 };
    orchestrator.start_turn(ticket, three_channel(&history));

    let verdict: JudgeVerdict = serde_json::from_str(LOST).unwrap();
    orchestrator.start_final(
        ticket,
        prompts::final_actor(level, &history, &verdict),
        prompts::final_monologue(level, &history, &verdict),
    );

    let failed = loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let TurnEventKind::Failed { channel, .. } = event.kind {
            break channel;
        }
    };
    assert_eq!(failed, Channel::Monologue);
}
