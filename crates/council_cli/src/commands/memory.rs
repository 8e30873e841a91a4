//! Memory commands.

use anyhow::Result;
use clap::Subcommand;
use serde_json::Value;

use super::GlobalArgs;

#[derive(Subcommand)]
pub enum MemoryCommand {
    /// List memories in a conversation
    List {
        /// Conversation id
        conversation: String,

        /// Only this advisor's memories
        #[arg(long)]
        advisor: Option<String>,
    },

    /// Store a value; JSON is parsed, anything else is kept as a string
    Set {
        conversation: String,
        advisor: String,
        key: String,
        value: String,
    },

    /// Delete every memory an advisor holds in a conversation
    Clear {
        conversation: String,
        advisor: String,
    },
}

pub async fn execute(global: &GlobalArgs, command: MemoryCommand) -> Result<()> {
    let state = global.open_state()?;
    let memory = state.manager.memory();
    let caller = global.caller();

    match command {
        MemoryCommand::List {
            conversation,
            advisor,
        } => {
            let memories = memory
                .get_conversation_memories(&caller, &conversation, advisor.as_deref())
                .await?;
            if memories.is_empty() {
                println!("No memories");
            }
            for m in memories {
                println!("{}  {} = {}", m.advisor_id, m.key, m.value);
            }
        }
        MemoryCommand::Set {
            conversation,
            advisor,
            key,
            value,
        } => {
            let stored = memory
                .set_memory(&caller, &conversation, &advisor, &key, parse_value(&value))
                .await?;
            println!("✅ {} = {}", stored.key, stored.value);
        }
        MemoryCommand::Clear {
            conversation,
            advisor,
        } => {
            let cleared = memory
                .clear_advisor_memories(&caller, &conversation, &advisor)
                .await?;
            println!("🗑️  Cleared {} memories", cleared);
        }
    }

    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
