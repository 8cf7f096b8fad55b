//! Identifier of a configured stage (an entity pipeline or a view).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageKey(String);

impl StageKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Default output table name for this stage.
    pub fn default_table(&self) -> String {
        format!("silver_{}", self.0)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
