//! Host-side runtime facade.
//!
//! Executing code reaches back into the host through a small set of
//! `runtime.*` operations.  Each privileged operation consults a config gate
//! and/or the user before acting:
//!
//! - `install_packages` -- gated by `auto_install`, runs the host package
//!   installer for names not already installed in this process.
//! - `get_env` -- serves values from the env table, gated by `auto_getenv`
//!   otherwise; values entered by the user are stored for later blocks.
//! - `display` -- broadcast on the event bus for whatever sink is attached.
//! - `input` -- forwarded to the [`Prompter`].
//! - `get_code_by_id` -- resolved against the task's block registry through
//!   an injected resolver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;

use opentask_kernel::{EventBus, events};

// ---------------------------------------------------------------------------
// User interaction seam
// ---------------------------------------------------------------------------

/// Interaction point for confirmation gates and stdin requests.
///
/// Interactive surfaces (shell, GUI) implement this; the core only depends
/// on the trait.
pub trait Prompter: Send + Sync {
    /// Ask the user a yes/no question.
    fn confirm(&self, prompt: &str) -> bool;

    /// Ask the user for a line of input.
    fn input(&self, prompt: &str) -> String;
}

/// Prompter for non-interactive use: denies every confirmation and returns
/// empty input.
#[derive(Debug, Default)]
pub struct DenyPrompter;

impl Prompter for DenyPrompter {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }

    fn input(&self, _prompt: &str) -> String {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Env table
// ---------------------------------------------------------------------------

/// A stored environment variable: its value plus the purpose it was
/// requested for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvEntry {
    pub value: String,
    pub desc: String,
}

/// Mapping from env-var name to its entry.
pub type EnvTable = HashMap<String, EnvEntry>;

/// Env table shared between the task manager and the runtime.
pub type SharedEnvTable = Arc<Mutex<EnvTable>>;

/// Resolves a block id to its code, injected by the owning task.
pub type CodeResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

// ---------------------------------------------------------------------------
// ExecRuntime
// ---------------------------------------------------------------------------

/// The host half of the `runtime` object visible inside executing blocks.
pub struct ExecRuntime {
    envs: SharedEnvTable,
    installed: Mutex<HashSet<String>>,
    auto_install: bool,
    auto_getenv: bool,
    interpreter: String,
    prompter: Arc<dyn Prompter>,
    bus: EventBus,
    code_resolver: Mutex<Option<CodeResolver>>,
}

impl ExecRuntime {
    /// Create a runtime over a shared env table.
    pub fn new(
        envs: SharedEnvTable,
        auto_install: bool,
        auto_getenv: bool,
        interpreter: impl Into<String>,
        prompter: Arc<dyn Prompter>,
        bus: EventBus,
    ) -> Self {
        Self {
            envs,
            installed: Mutex::new(HashSet::new()),
            auto_install,
            auto_getenv,
            interpreter: interpreter.into(),
            prompter,
            bus,
            code_resolver: Mutex::new(None),
        }
    }

    /// Install the resolver used by `get_code_by_id`.  Called by the task
    /// once its block registry exists.
    pub fn set_code_resolver(&self, resolver: CodeResolver) {
        *self.code_resolver.lock().unwrap_or_else(|e| e.into_inner()) = Some(resolver);
    }

    /// The interpreter binary this runtime shells out to.
    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Names of every registered env var (used for result masking).
    pub fn env_names(&self) -> HashSet<String> {
        self.lock_envs().keys().cloned().collect()
    }

    /// Flat name → value view handed to the interpreter harness.
    pub fn env_values(&self) -> HashMap<String, String> {
        self.lock_envs()
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Record an env var.
    pub fn set_env(&self, name: impl Into<String>, value: impl Into<String>, desc: impl Into<String>) {
        self.lock_envs().insert(
            name.into(),
            EnvEntry {
                value: value.into(),
                desc: desc.into(),
            },
        );
    }

    /// Handle a `runtime.install_packages(...)` request.
    ///
    /// Prompts unless `auto_install` is set, then installs every name not
    /// already recorded as installed in this process.  Returns overall
    /// success.
    pub async fn install_packages(&self, names: &[String]) -> bool {
        if names.is_empty() {
            return true;
        }

        tracing::warn!(packages = ?names, "code requested package installation");
        if !self.auto_install {
            let prompt = format!("Install third-party packages {names:?}? [y/N] ");
            if !self.prompter.confirm(&prompt) {
                tracing::info!("package installation declined");
                return false;
            }
        }

        self.ensure_packages(names).await
    }

    /// Install the subset of `names` that has not been installed yet.
    async fn ensure_packages(&self, names: &[String]) -> bool {
        let pending: Vec<String> = {
            let installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
            names
                .iter()
                .filter(|n| !installed.contains(*n))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return true;
        }

        let status = tokio::process::Command::new(&self.interpreter)
            .arg("-m")
            .arg("pip")
            .arg("install")
            .args(&pending)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                self.installed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend(pending);
                true
            }
            Ok(status) => {
                tracing::error!(%status, packages = ?pending, "package installation failed");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to launch package installer");
                false
            }
        }
    }

    /// Handle a `runtime.get_env(...)` request.
    ///
    /// Table hit wins; otherwise `auto_getenv` short-circuits to the default
    /// and an interactive session may supply (and store) a value.
    pub fn get_env(&self, name: &str, default: Option<&str>, desc: Option<&str>) -> Option<String> {
        let desc = desc.unwrap_or_default();
        tracing::info!(name, desc, "code requested env var");

        if let Some(entry) = self.lock_envs().get(name) {
            return Some(entry.value.clone());
        }

        if self.auto_getenv {
            return default.map(str::to_owned);
        }

        let value = self
            .prompter
            .input(&format!("Environment variable {name} not found, please enter: "));
        let value = value.trim().to_owned();
        if value.is_empty() {
            default.map(str::to_owned)
        } else {
            self.set_env(name, value.clone(), desc);
            Some(value)
        }
    }

    /// Handle a `runtime.display(...)` request by broadcasting on the bus.
    pub fn display(&self, path: Option<&str>, url: Option<&str>) {
        self.bus
            .broadcast(events::DISPLAY, json!({"path": path, "url": url}));
    }

    /// Handle an `input(...)` request from executing code.
    pub fn input(&self, prompt: &str) -> String {
        self.prompter.input(prompt)
    }

    /// Handle a `runtime.get_code_by_id(...)` request.
    pub fn get_code_by_id(&self, id: &str) -> Option<String> {
        let resolver = self.code_resolver.lock().unwrap_or_else(|e| e.into_inner());
        match resolver.as_ref() {
            Some(resolve) => resolve(id),
            None => {
                tracing::warn!(id, "get_code_by_id with no resolver installed");
                None
            }
        }
    }

    fn lock_envs(&self) -> std::sync::MutexGuard<'_, EnvTable> {
        self.envs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
