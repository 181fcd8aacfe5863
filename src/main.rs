use std::io::{self, Write};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mouthpiece::cli::{Cli, Command};
use mouthpiece::client::{start_stream, LlmClient};
use mouthpiece::config::Config;
use mouthpiece::error::{MouthpieceError, Result};
use mouthpiece::levels::{level_by_id, ARENA_LEVELS};
use mouthpiece::orchestrator::{ArenaCommand, ArenaController, ArenaHandle, ArenaView};
use mouthpiece::plans::{Plan, PlanMode, PlanStream};
use mouthpiece::prompts;
use mouthpiece::providers::ChatRequest;
use mouthpiece::relay::RelayOutcome;
use mouthpiece::render::{paint_entry, paint_plan_line, paint_status, PlanPrinter};

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

enum StreamMsg {
    Delta(String),
    Done(Result<RelayOutcome>),
}

async fn run_plans(
    client: Arc<LlmClient>,
    request: ChatRequest,
    mut plans: PlanStream,
    json: bool,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let done_tx = tx.clone();
    let handle = start_stream(
        client,
        request,
        CancellationToken::new(),
        move |delta: &str| {
            let _ = tx.send(StreamMsg::Delta(delta.to_string()));
        },
        move |result| {
            let _ = done_tx.send(StreamMsg::Done(result));
        },
    );

    let mut printer = PlanPrinter::new();
    let mut latest: Vec<Plan> = Vec::new();
    let outcome = loop {
        let msg = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                break Ok(RelayOutcome::Cancelled);
            }
            msg = rx.recv() => msg,
        };
        match msg {
            Some(StreamMsg::Delta(delta)) => {
                latest = plans.push(&delta);
                if !json {
                    for line in printer.update(&latest) {
                        println!("{}", paint_plan_line(&line));
                    }
                }
            }
            Some(StreamMsg::Done(result)) => break result,
            None => break Ok(RelayOutcome::Closed),
        }
    };
    handle.join().await;
    let outcome = outcome?;

    if json {
        let text = serde_json::to_string_pretty(&latest)
            .map_err(|e| MouthpieceError::json("plans", e))?;
        println!("{text}");
    } else {
        for line in printer.update(&latest) {
            println!("{}", paint_plan_line(&line));
        }
        if latest.is_empty() {
            println!("{}", "没有收到任何方案，换个说法再试一次。".bright_red());
        }
    }
    if outcome == RelayOutcome::Closed {
        tracing::warn!(target: "mouthpiece::cli", "stream closed without end marker");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Arena REPL
// ---------------------------------------------------------------------------

fn print_levels() {
    for level in ARENA_LEVELS.iter() {
        println!(
            "  {} {}  {}",
            level.id.to_string().bright_yellow(),
            level.title.bright_white().bold(),
            level.user_context.dimmed()
        );
    }
}

fn print_from(view: &ArenaView, from: usize) -> usize {
    for entry in view.history.iter().skip(from) {
        if let Some(line) = paint_entry(entry, view.opponent_name) {
            println!("{line}");
        }
    }
    view.history.len()
}

fn print_header(view: &ArenaView) -> usize {
    println!("\n{}", format!("=== {} ===", view.level_title).bright_cyan().bold());
    println!(
        "{}",
        "命令: /retry 重来  /next 下一关  /level N 选关  /levels 关卡列表  /quit 退出".dimmed()
    );
    print_from(view, 0)
}

/// Send a command and wait until the controller has handled it and any turn
/// it started has settled.
async fn dispatch(handle: &mut ArenaHandle, command: ArenaCommand) -> Result<ArenaView> {
    let mut views = handle.subscribe();
    views.borrow_and_update();
    handle.send(command).await?;
    views
        .changed()
        .await
        .map_err(|_| MouthpieceError::Stream("arena controller has stopped".to_string()))?;
    if views.borrow().typing {
        println!("{}", "对方正在输入...".dimmed());
    }
    handle.wait_for(|v| !v.typing).await
}

async fn run_arena(client: Arc<LlmClient>, config: &Config, level_id: u32) -> Result<()> {
    let level = level_by_id(level_id)
        .ok_or_else(|| MouthpieceError::Config(format!("unknown level {level_id}")))?;
    let (mut handle, task) =
        ArenaController::spawn(client, level, config.arena_mode, config.event_buffer);

    let mut shown = print_header(&handle.view());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", ">".bright_green());
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        let (command, restart) = match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/levels" => {
                print_levels();
                continue;
            }
            "/retry" => (ArenaCommand::Retry, true),
            "/next" => (ArenaCommand::NextLevel, true),
            cmd if cmd.starts_with("/level") => {
                match cmd.trim_start_matches("/level").trim().parse() {
                    Ok(id) => (ArenaCommand::SelectLevel(id), true),
                    Err(_) => {
                        println!("{}", "用法: /level 2".bright_red());
                        continue;
                    }
                }
            }
            text => (ArenaCommand::Send(text.to_string()), false),
        };

        let before = handle.view();
        let view = dispatch(&mut handle, command).await?;
        let reset = restart
            && (view.level_id != before.level_id
                || view.history.len() < shown
                || view.phase != before.phase);
        shown = if reset { print_header(&view) } else { print_from(&view, shown) };

        println!("{}", paint_status(&view));
        if let Some(text) = &view.failed_input {
            println!("{} {}", "未发送:".bright_red(), text);
        }
        if view.review.is_some() {
            let hint = if view.state.is_win && view.has_next_level {
                "/next 进入下一关，"
            } else {
                ""
            };
            println!("{}", format!("本关结束。{hint}/retry 再来一次").bright_white());
        }
    }

    let _ = handle.send(ArenaCommand::Shutdown).await;
    let _ = task.await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "mouthpiece", &mut io::stdout());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    init_tracing(&config.log_level);

    if let Command::Levels = cli.command {
        print_levels();
        return Ok(());
    }

    let client = match LlmClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{} {}", "error:".bright_red().bold(), e);
            std::process::exit(2);
        }
    };

    match &cli.command {
        Command::Online { text, json, .. } => {
            let input = cli.command.online_input().unwrap_or_default();
            let plans = PlanStream::new(PlanMode::Online).with_source(text.as_str());
            run_plans(client, prompts::online_plans(&input), plans, *json).await?;
        }
        Command::Offline { json, .. } => {
            let input = cli.command.offline_input().unwrap_or_default();
            let plans = PlanStream::new(PlanMode::Offline);
            run_plans(client, prompts::offline_plans(&input), plans, *json).await?;
        }
        Command::Arena { level } => run_arena(client, &config, *level).await?,
        Command::Levels | Command::Completions { .. } => {}
    }

    Ok(())
}
