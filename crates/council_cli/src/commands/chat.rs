//! Chat and mention commands.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use council_core::StreamState;
use tokio::sync::mpsc;

use super::GlobalArgs;

#[derive(Args)]
pub struct MentionsArgs {
    /// Message text, e.g. "@Sarah what do you think?"
    content: String,
}

pub async fn mentions(global: &GlobalArgs, args: MentionsArgs) -> Result<()> {
    let state = global.open_state()?;
    let advisors = state
        .manager
        .resolve_mentions(&global.caller(), &args.content)
        .await?;

    if advisors.is_empty() {
        println!("No advisors mentioned");
    }
    for advisor in advisors {
        println!("{}  @{}  {}", advisor.id, advisor.handle, advisor.name);
    }
    Ok(())
}

#[derive(Args)]
pub struct ChatArgs {
    /// Conversation id
    conversation: String,

    /// Message text
    content: String,
}

/// Send a message and print the replies as they stream in
pub async fn execute(global: &GlobalArgs, args: ChatArgs) -> Result<()> {
    let state = global.open_state()?;
    let caller = global.caller();

    let (tx, mut rx) = mpsc::channel::<String>(32);
    let printer = async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let _ = write!(stdout, "{}", chunk);
            let _ = stdout.flush();
        }
    };
    let turn = state
        .manager
        .send_message(&caller, &args.conversation, &args.content, Some(tx));
    let (outcome, ()) = tokio::join!(turn, printer);
    let outcome = outcome?;

    if outcome.replies.is_empty() {
        println!("(stored; no advisor was addressed)");
        return Ok(());
    }
    println!();
    for reply in &outcome.replies {
        if reply.state == StreamState::Aborted {
            eprintln!(
                "⚠️  Reply from {} stopped early: {}",
                reply.advisor_id,
                reply.error.as_deref().unwrap_or("unknown reason")
            );
        }
    }
    Ok(())
}
