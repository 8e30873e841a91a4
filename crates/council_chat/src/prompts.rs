//! Prompt assembly for advisor replies.
//!
//! The system prompt is built from the advisor's identity, mission, scope and
//! persona, followed by the memories it holds in the conversation. History is
//! the most recent window of finished messages, seen from the advisor's side:
//! its own replies are assistant turns, everything else is a user turn.

use std::fmt::Write as _;

use council_core::{Advisor, AdvisorMemory, Message, Sender};

use crate::llm::{CompletionRequest, PromptMessage};

/// Builds completion requests for one advisor.
#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    history_window: usize,
}

impl PromptBuilder {
    pub fn new(history_window: usize) -> Self {
        Self { history_window }
    }

    pub fn build(
        &self,
        advisor: &Advisor,
        council: &[Advisor],
        memories: &[AdvisorMemory],
        history: &[Message],
    ) -> CompletionRequest {
        CompletionRequest {
            advisor_id: advisor.id.clone(),
            system: self.system_prompt(advisor, memories),
            messages: self.history(advisor, council, history),
        }
    }

    pub fn system_prompt(&self, advisor: &Advisor, memories: &[AdvisorMemory]) -> String {
        let mut prompt = String::new();
        let display_name = advisor
            .persona
            .as_ref()
            .map(|p| p.identity.display_name.as_str())
            .unwrap_or(&advisor.name);

        let _ = writeln!(prompt, "You are {}, {}.", display_name, advisor.one_liner);
        let _ = writeln!(prompt, "\nMission: {}", advisor.mission);

        if let Some(persona) = &advisor.persona {
            match &persona.identity.title {
                Some(title) => {
                    let _ = writeln!(prompt, "Role: {} ({})", persona.role, title);
                }
                None => {
                    let _ = writeln!(prompt, "Role: {}", persona.role);
                }
            }
            let _ = writeln!(prompt, "Style: {}", persona.advice_style.guidance());
        }

        if !advisor.scope_in.is_empty() {
            let _ = writeln!(prompt, "\nYou advise on:");
            for item in &advisor.scope_in {
                let _ = writeln!(prompt, "- {}", item);
            }
        }
        if !advisor.scope_out.is_empty() {
            let _ = writeln!(
                prompt,
                "\nOutside your scope (say so and suggest another advisor):"
            );
            for item in &advisor.scope_out {
                let _ = writeln!(prompt, "- {}", item);
            }
        }

        if !memories.is_empty() {
            let _ = writeln!(prompt, "\nWhat you remember from this conversation:");
            for memory in memories {
                let value = match &memory.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let _ = writeln!(prompt, "- {}: {}", memory.key, value);
            }
        }

        prompt.push_str(
            "\nOther advisors may take part in this conversation. \
             Reply only as yourself and keep your answer focused.",
        );
        prompt
    }

    fn history(
        &self,
        advisor: &Advisor,
        council: &[Advisor],
        history: &[Message],
    ) -> Vec<PromptMessage> {
        let usable: Vec<&Message> = history
            .iter()
            .filter(|m| m.sender != Sender::System && !m.content.trim().is_empty())
            .collect();
        let start = usable.len().saturating_sub(self.history_window);

        usable[start..]
            .iter()
            .map(|m| match (&m.sender, m.advisor_id.as_deref()) {
                (Sender::Advisor, Some(id)) if id == advisor.id => {
                    PromptMessage::assistant(m.content.clone())
                }
                (Sender::Advisor, id) => {
                    let speaker = id
                        .and_then(|id| council.iter().find(|a| a.id == id))
                        .map(|a| a.name.as_str())
                        .unwrap_or("Another advisor");
                    PromptMessage::user(format!("{} said: {}", speaker, m.content))
                }
                _ => PromptMessage::user(m.content.clone()),
            })
            .collect()
    }
}
