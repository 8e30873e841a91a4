//! CLI command definitions.
//!
//! Every command except `serve` opens the data directory, runs one operation
//! as the `--user` caller and exits. A data directory can be open in only one
//! process at a time, so while `council serve` holds it the other commands
//! fail with a conflict; use the HTTP API instead.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use council_guard::AuthContext;
use council_server::AppState;

pub mod advisor;
pub mod chat;
pub mod conversation;
pub mod memory;
pub mod serve;

/// Council - a personal board of AI advisors
#[derive(Parser)]
#[command(name = "council")]
#[command(version, about = "Council - a personal board of AI advisors")]
#[command(long_about = r#"
Council keeps a set of AI advisors per user and lets them answer in shared
conversations. Address an advisor with @FirstName or @First Last.

COMMANDS:
  serve         → Run the HTTP API
  advisor       → Create, list, archive and select advisors
  conversation  → Create, inspect and delete conversations
  mentions      → Show which advisors a message would reach
  chat          → Send a message and stream the replies
  memory        → Inspect and edit advisor memories

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid payload or arguments
  3 - Not signed in, or not allowed
  4 - Not found
  5 - Rate limited
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Act as this user
    #[arg(short, long, global = true, env = "COUNCIL_USER")]
    pub user: Option<String>,

    /// Directory holding council.toml and state.json
    #[arg(long, global = true, env = "COUNCIL_DATA_DIR", default_value = ".council")]
    pub data_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

impl GlobalArgs {
    /// Open the data directory.
    pub fn open_state(&self) -> Result<AppState> {
        AppState::open(&self.data_dir)
            .with_context(|| format!("opening {}", self.data_dir.display()))
    }

    pub fn caller(&self) -> AuthContext {
        AuthContext::from_optional(self.user.clone())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API server
    Serve(serve::ServeArgs),

    /// Manage advisors
    #[command(subcommand)]
    Advisor(advisor::AdvisorCommand),

    /// Manage conversations
    #[command(subcommand)]
    Conversation(conversation::ConversationCommand),

    /// Resolve @mentions in a message without sending it
    Mentions(chat::MentionsArgs),

    /// Send a message to a conversation
    Chat(chat::ChatArgs),

    /// Manage advisor memories
    #[command(subcommand)]
    Memory(memory::MemoryCommand),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_data_dir_open_in_one_place_only() {
        let temp = tempfile::tempdir().unwrap();
        let global = GlobalArgs {
            user: Some("u1".to_string()),
            data_dir: temp.path().join("council"),
            verbose: false,
            json_logs: false,
        };

        let state = global.open_state().unwrap();
        let err = global.open_state().err().expect("second open should fail");
        assert!(format!("{:#}", err).contains("in use"));

        drop(state);
        assert!(global.open_state().is_ok());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "council",
            "conversation",
            "list",
            "--user",
            "u1",
            "--data-dir",
            "/tmp/council",
        ])
        .unwrap();
        assert_eq!(cli.global.user.as_deref(), Some("u1"));
        assert_eq!(cli.global.data_dir, PathBuf::from("/tmp/council"));
        assert!(cli.global.caller().is_authenticated());
    }
}
