//! Advisor persona definitions.
//!
//! A persona is the behavioral configuration an advisor brings into a
//! conversation: who it is, what role it plays, and how it gives advice.
//! Unknown fields are carried in a bounded `extensions` map so newer
//! clients can attach data without the core having to understand it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Maximum number of extension entries on a persona.
pub const MAX_PERSONA_EXTENSIONS: usize = 16;

/// Maximum length of an extension key.
pub const MAX_EXTENSION_KEY_LEN: usize = 64;

/// How an advisor frames its advice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdviceStyle {
    #[default]
    Direct,
    Socratic,
    Supportive,
    Analytical,
}

impl AdviceStyle {
    /// Prompt guidance for this style.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Direct => "Give clear, actionable recommendations without hedging.",
            Self::Socratic => "Guide the user with probing questions before offering conclusions.",
            Self::Supportive => "Be encouraging and acknowledge constraints before suggesting changes.",
            Self::Analytical => "Break problems into parts and reason from evidence and trade-offs.",
        }
    }
}

/// Who the advisor presents itself as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaIdentity {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A closed persona structure with a bounded extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub identity: PersonaIdentity,
    pub role: String,
    #[serde(default)]
    pub advice_style: AdviceStyle,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Persona {
    pub fn new(display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: PersonaIdentity {
                display_name: display_name.into(),
                title: None,
            },
            role: role.into(),
            advice_style: AdviceStyle::default(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.identity.title = Some(title.into());
        self
    }

    pub fn with_style(mut self, style: AdviceStyle) -> Self {
        self.advice_style = style;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Check required fields and extension bounds.
    pub fn validate(&self) -> CoreResult<()> {
        if self.identity.display_name.trim().is_empty() {
            return Err(CoreError::InvalidPayload(
                "persona.identity.displayName must not be empty".to_string(),
            ));
        }
        if self.role.trim().is_empty() {
            return Err(CoreError::InvalidPayload(
                "persona.role must not be empty".to_string(),
            ));
        }
        if self.extensions.len() > MAX_PERSONA_EXTENSIONS {
            return Err(CoreError::InvalidPayload(format!(
                "persona.extensions has {} entries (max {})",
                self.extensions.len(),
                MAX_PERSONA_EXTENSIONS
            )));
        }
        if let Some(key) = self
            .extensions
            .keys()
            .find(|k| k.trim().is_empty() || k.len() > MAX_EXTENSION_KEY_LEN)
        {
            return Err(CoreError::InvalidPayload(format!(
                "persona extension key '{}' must be 1-{} characters",
                key, MAX_EXTENSION_KEY_LEN
            )));
        }
        Ok(())
    }
}
