use serde::{Deserialize, Serialize};

/// An independently developable unit of implementation work (a story).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WorkUnit {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Units that must be integrated before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}
