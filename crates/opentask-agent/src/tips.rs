//! Role and tips catalog.
//!
//! Tips files are TOML documents describing a role plus its local best
//! practices:
//!
//! ```toml
//! [tips.role]
//! name = "opentask"
//! short = "General task assistant"
//! detail = "You are an assistant that completes tasks by writing code."
//!
//! [tips.charts]
//! short = "Chart rendering"
//! detail = "Save charts to files and show them with runtime.display()."
//! ```
//!
//! The role's `detail` becomes the system prompt's role segment; the other
//! entries render as `<name>...</name>` fragments in the tips segment.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AgentError, Result};

/// One named tip.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tip {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short: String,
    #[serde(default)]
    pub detail: String,
}

impl Tip {
    /// Render as an XML-style fragment for the system prompt.
    fn render(&self) -> String {
        format!("<{}>\n{}\n</{}>", self.name, self.detail.trim(), self.name)
    }
}

/// A role plus its tips, loaded from one TOML file.
#[derive(Debug, Clone)]
pub struct Tips {
    pub role: Tip,
    tips: BTreeMap<String, Tip>,
}

impl Tips {
    /// Parse a tips document from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct TipsFile {
            #[serde(default)]
            tips: BTreeMap<String, Tip>,
        }

        let mut file: TipsFile = toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid tips file: {e}"),
        })?;

        let role = file.tips.remove("role").ok_or_else(|| AgentError::ConfigError {
            reason: "tips file has no [tips.role] entry".into(),
        })?;

        let tips = file
            .tips
            .into_iter()
            .map(|(name, mut tip)| {
                tip.name = name.clone();
                (name, tip)
            })
            .collect();

        Ok(Self { role, tips })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    pub fn name(&self) -> &str {
        &self.role.name
    }

    pub fn len(&self) -> usize {
        self.tips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tip> {
        self.tips.get(name)
    }

    /// Render the tips segment for the system prompt.
    pub fn render(&self) -> String {
        let mut lines = vec!["<tips>".to_owned()];
        lines.extend(self.tips.values().map(Tip::render));
        lines.push("</tips>".to_owned());
        lines.join("\n")
    }
}

/// Loads tips files from a directory and tracks the selected role.
#[derive(Debug, Default)]
pub struct TipsManager {
    tips: BTreeMap<String, Tips>,
    current: Option<String>,
}

impl TipsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file in a directory (underscore-prefixed files
    /// are skipped).  Files that fail to parse are logged and ignored.
    pub fn load_dir(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(dir = %dir.display(), "tips directory not readable");
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".toml") || file_name.starts_with('_') {
                continue;
            }
            match Tips::load(&path) {
                Ok(tips) => {
                    tracing::info!(role = %tips.name(), count = tips.len(), "loaded tips");
                    self.tips.insert(tips.name().to_lowercase(), tips);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to load tips file");
                }
            }
        }

        if self.current.is_none() {
            self.current = self.tips.keys().next().cloned();
        }
    }

    /// Select a role by name.  Returns false for unknown roles.
    pub fn use_role(&mut self, name: &str) -> bool {
        let name = name.to_lowercase();
        if self.tips.contains_key(&name) {
            tracing::info!(role = %name, "using tips role");
            self.current = Some(name);
            true
        } else {
            false
        }
    }

    /// The currently selected tips, if any were loaded.
    pub fn current(&self) -> Option<&Tips> {
        self.current.as_deref().and_then(|name| self.tips.get(name))
    }

    pub fn role_names(&self) -> Vec<&str> {
        self.tips.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
