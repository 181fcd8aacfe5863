use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{ArenaMode, Config};
use crate::prompts::{OfflineInput, OnlineInput};

#[derive(Parser, Debug)]
#[command(name = "mouthpiece")]
#[command(version)]
#[command(about = "Streaming social advisor: reply plans, action scripts and a negotiation arena")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Model name (overrides config and MODEL_NAME)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Chat-completions endpoint URL
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// How arena turns are requested
    #[arg(long, global = true, value_enum)]
    pub arena_mode: Option<ArenaMode>,

    /// Default log filter when RUST_LOG is unset (e.g. info, mouthpiece=debug)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Three reply plans for a chat message
    Online {
        /// The message you received
        text: String,

        /// Who sent it
        #[arg(long, default_value = "同事")]
        role: String,

        /// What you want out of the exchange
        #[arg(long, default_value = "得体回应")]
        intent: String,

        /// Relationship closeness, 0-10
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=10))]
        score: u8,

        /// Print the final plans as JSON instead of streaming them
        #[arg(long)]
        json: bool,
    },

    /// Two action scripts for an in-person situation
    Offline {
        /// The scene, e.g. "年终饭局"
        scenario: String,

        #[arg(long)]
        role: Option<String>,

        #[arg(long)]
        who: Option<String>,

        #[arg(long)]
        intent: Option<String>,

        #[arg(long)]
        supplement: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Play the negotiation game in the terminal
    Arena {
        /// Level to start on
        #[arg(long, default_value_t = 1)]
        level: u32,
    },

    /// List arena levels
    Levels,

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Apply command-line overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(mode) = self.arena_mode {
            config.arena_mode = mode;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

impl Command {
    pub fn online_input(&self) -> Option<OnlineInput> {
        match self {
            Command::Online { text, role, intent, score, .. } => Some(OnlineInput {
                role: role.clone(),
                intent: intent.clone(),
                score: *score,
                text: text.clone(),
            }),
            _ => None,
        }
    }

    pub fn offline_input(&self) -> Option<OfflineInput> {
        match self {
            Command::Offline { scenario, role, who, intent, supplement, .. } => Some(OfflineInput {
                scenario: scenario.clone(),
                role: role.clone(),
                who: who.clone(),
                intent: intent.clone(),
                supplement: supplement.clone(),
            }),
            _ => None,
        }
    }
}
