//! JSON snapshot of the whole arena.
//!
//! ```text
//! <data_dir>/
//! ├── council.lock   # Held by the process that has the directory open
//! ├── council.toml   # Optional settings
//! └── state.json     # Snapshot written after every mutation
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::models::{
    Advisor, AdvisorMemory, Conversation, IdempotencyRecord, Message, RateLimitWindow,
    UserAdvisorLink,
};

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "state.json";

/// File locked for as long as a repository has the data directory open.
pub const LOCK_FILE: &str = "council.lock";

/// Flat, serializable copy of every table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub advisors: Vec<Advisor>,
    pub links: Vec<UserAdvisorLink>,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub memories: Vec<AdvisorMemory>,
    pub idempotency: Vec<IdempotencyRecord>,
    pub rate_windows: Vec<RateLimitWindow>,
}

impl Snapshot {
    /// Read a snapshot, or an empty one when the file does not exist yet.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write through a temporary file so a crash never leaves half a snapshot.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
