//! Conversation commands.

use anyhow::Result;
use clap::Subcommand;
use council_chat::ConversationUpdate;
use council_core::{Message, Sender};

use super::GlobalArgs;

#[derive(Subcommand)]
pub enum ConversationCommand {
    /// Start a conversation
    Create {
        /// Title (defaults to "New conversation")
        #[arg(long)]
        title: Option<String>,
    },

    /// List your conversations, most recent first
    List,

    /// Print a conversation's messages
    Show {
        /// Conversation id
        id: String,
    },

    /// Rename a conversation or change its active advisor
    Update {
        /// Conversation id
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// Advisor that answers messages without a mention
        #[arg(long, conflicts_with = "clear_active")]
        active_advisor: Option<String>,

        /// Unset the active advisor
        #[arg(long)]
        clear_active: bool,
    },

    /// Delete a conversation with its messages and memories
    Delete {
        /// Conversation id
        id: String,
    },
}

pub async fn execute(global: &GlobalArgs, command: ConversationCommand) -> Result<()> {
    let state = global.open_state()?;
    let conversations = state.manager.conversations();
    let caller = global.caller();

    match command {
        ConversationCommand::Create { title } => {
            let conversation = conversations.create(&caller, title.as_deref()).await?;
            println!("✅ Created \"{}\" ({})", conversation.title, conversation.id);
        }
        ConversationCommand::List => {
            let list = conversations.list(&caller).await?;
            if list.is_empty() {
                println!("No conversations yet");
            }
            for conversation in list {
                println!(
                    "{}  {}  (updated {})",
                    conversation.id,
                    conversation.title,
                    conversation.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        ConversationCommand::Show { id } => {
            let conversation = conversations.get(&caller, &id).await?;
            println!("# {}", conversation.title);
            for message in conversations.list_messages(&caller, &id).await? {
                println!("{}", render(&message));
            }
        }
        ConversationCommand::Update {
            id,
            title,
            active_advisor,
            clear_active,
        } => {
            let active_advisor_id = if clear_active {
                Some(None)
            } else {
                active_advisor.map(Some)
            };
            let conversation = conversations
                .update(
                    &caller,
                    &id,
                    ConversationUpdate {
                        title,
                        active_advisor_id,
                    },
                )
                .await?;
            println!("✅ Updated \"{}\"", conversation.title);
        }
        ConversationCommand::Delete { id } => {
            conversations.delete(&caller, &id).await?;
            println!("🗑️  Deleted {}", id);
        }
    }

    Ok(())
}

fn render(message: &Message) -> String {
    let speaker = match message.sender {
        Sender::User => "you".to_string(),
        Sender::Advisor => message.advisor_id.clone().unwrap_or_default(),
        Sender::System => "system".to_string(),
    };
    let marker = if message.partial { " [partial]" } else { "" };
    format!("[{}]{} {}", speaker, marker, message.content)
}
