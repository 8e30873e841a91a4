//! @mention extraction.
//!
//! Resolution runs in two passes over the message text:
//!
//! 1. `@First Last` two-token mentions compared against each advisor's full
//!    display name.
//! 2. Only when pass 1 found nothing: single-token `@First` mentions compared
//!    against each advisor's first name.
//!
//! Matching is case-insensitive. When several advisors share a name, the
//! first one in the supplied list wins.

use std::collections::HashSet;
use std::sync::OnceLock;

use council_core::{Advisor, AdvisorId};
use regex::Regex;
use tracing::debug;

fn full_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@(\w+)\s+(\w+)").expect("valid full-name pattern"))
}

fn first_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@(\w+)").expect("valid first-name pattern"))
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Maps @mention tokens in free text to advisor identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct MentionResolver;

impl MentionResolver {
    pub fn new() -> Self {
        Self
    }

    /// Ids of the advisors mentioned in `text`, in discovery order, without duplicates.
    pub fn extract_mentions(&self, text: &str, advisors: &[Advisor]) -> Vec<AdvisorId> {
        self.resolve(text, advisors)
            .into_iter()
            .map(|a| a.id.clone())
            .collect()
    }

    /// Same as [`extract_mentions`](Self::extract_mentions) but returns the advisors.
    pub fn resolve<'a>(&self, text: &str, advisors: &'a [Advisor]) -> Vec<&'a Advisor> {
        if advisors.is_empty() || !text.contains('@') {
            return Vec::new();
        }

        let full_names: Vec<String> = advisors.iter().map(|a| normalize(&a.name)).collect();
        let tokens = full_name_pattern()
            .captures_iter(text)
            .map(|c| format!("{} {}", &c[1], &c[2]).to_lowercase());
        let found = collect_matches(tokens, advisors, &full_names);
        if !found.is_empty() {
            debug!("Resolved {} full-name mention(s)", found.len());
            return found;
        }

        let first_names: Vec<String> = advisors
            .iter()
            .map(|a| a.first_name().to_lowercase())
            .collect();
        let tokens = first_name_pattern()
            .captures_iter(text)
            .map(|c| c[1].to_lowercase());
        let found = collect_matches(tokens, advisors, &first_names);
        debug!("Resolved {} first-name mention(s)", found.len());
        found
    }
}

fn collect_matches<'a>(
    tokens: impl Iterator<Item = String>,
    advisors: &'a [Advisor],
    names: &[String],
) -> Vec<&'a Advisor> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for token in tokens {
        let Some(index) = names.iter().position(|n| !n.is_empty() && *n == token) else {
            continue;
        };
        let advisor = &advisors[index];
        if seen.insert(advisor.id.as_str()) {
            found.push(advisor);
        }
    }
    found
}
