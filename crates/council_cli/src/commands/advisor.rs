//! Advisor commands - Create, list, archive and select advisors.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use council_chat::AdvisorPayload;
use council_core::{Advisor, AdvisorStatus, Persona};

use super::GlobalArgs;

#[derive(Subcommand)]
pub enum AdvisorCommand {
    /// Create an advisor
    Create(CreateArgs),

    /// List your advisors
    List {
        /// Only show the advisors selected into your council
        #[arg(long)]
        selected: bool,
    },

    /// Archive an advisor
    Archive {
        /// Advisor id
        id: String,
    },

    /// Add an advisor to your council
    Select {
        /// Advisor id
        id: String,

        /// Group the selection under a team
        #[arg(long)]
        team_key: Option<String>,
    },

    /// Remove an advisor from your council
    Unselect {
        /// Advisor id
        id: String,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Display name, e.g. "Sarah Chen"
    name: String,

    /// One-line description
    #[arg(long)]
    one_liner: String,

    /// What the advisor helps with
    #[arg(long)]
    mission: String,

    /// Tags (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Topics in scope (repeatable)
    #[arg(long)]
    scope_in: Vec<String>,

    /// Topics out of scope (repeatable)
    #[arg(long)]
    scope_out: Vec<String>,

    /// Persona definition as a JSON file
    #[arg(long)]
    persona: Option<PathBuf>,

    /// Replays the earlier result when repeated
    #[arg(long)]
    idempotency_key: Option<String>,
}

pub async fn execute(global: &GlobalArgs, command: AdvisorCommand) -> Result<()> {
    let state = global.open_state()?;
    let registrar = state.manager.registrar();
    let caller = global.caller();

    match command {
        AdvisorCommand::Create(args) => {
            let persona = args.persona.as_deref().map(read_persona).transpose()?;
            let payload = AdvisorPayload {
                tags: args.tags,
                scope_in: args.scope_in,
                scope_out: args.scope_out,
                persona,
                ..AdvisorPayload::new(args.name, args.one_liner, args.mission)
            };
            let created = registrar
                .create_with_key(&caller, args.idempotency_key.as_deref(), payload)
                .await?;
            println!("✅ Created @{} ({})", created.handle, created.advisor_id);
        }
        AdvisorCommand::List { selected } => {
            let advisors = if selected {
                registrar.selected_advisors(&caller).await?
            } else {
                registrar.list_owned(&caller).await?
            };
            if advisors.is_empty() {
                println!("No advisors yet");
            }
            for advisor in &advisors {
                println!("{}", describe(advisor));
            }
        }
        AdvisorCommand::Archive { id } => {
            let advisor = registrar.archive(&caller, &id).await?;
            println!("🗄️  Archived @{}", advisor.handle);
        }
        AdvisorCommand::Select { id, team_key } => {
            if registrar.select(&caller, &id, team_key).await? {
                println!("✅ Added {} to your council", id);
            } else {
                println!("{} is already in your council", id);
            }
        }
        AdvisorCommand::Unselect { id } => {
            if registrar.unselect(&caller, &id).await? {
                println!("✅ Removed {} from your council", id);
            } else {
                println!("{} was not in your council", id);
            }
        }
    }

    Ok(())
}

fn read_persona(path: &std::path::Path) -> Result<Persona> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading persona {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing persona {}", path.display()))
}

fn describe(advisor: &Advisor) -> String {
    let archived = if advisor.status == AdvisorStatus::Archived {
        " [archived]"
    } else {
        ""
    };
    format!(
        "{}  @{}  {} - {}{}",
        advisor.id, advisor.handle, advisor.name, advisor.one_liner, archived
    )
}
