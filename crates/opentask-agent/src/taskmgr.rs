//! Task manager.
//!
//! Owns the long-lived pieces tasks are built from: settings, the shared
//! env table (seeded from the declared API descriptors), the LLM client
//! manager, the tips catalog, and the tool dispatcher.  `new_task()`
//! snapshots the system prompt (appending the tool protocol when dispatch
//! is enabled) and wires up a fresh [`Task`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentask_exec::{EnvEntry, EnvTable, ExecRuntime, Prompter, Runner, RunnerConfig, SharedEnvTable};
use opentask_kernel::EventBus;
use opentask_mcp::{StdioToolClient, ToolDispatcher};

use crate::config::Settings;
use crate::diagnose::Diagnostics;
use crate::error::Result;
use crate::llm::ClientManager;
use crate::prompt::{append_tool_protocol, build_system_prompt};
use crate::task::{SharedDispatcher, Task, TaskContext};
use crate::tips::TipsManager;

/// Build the production tool dispatcher over stdio servers.
pub fn stdio_dispatcher(catalog_path: &Path) -> Result<SharedDispatcher> {
    let dispatcher = ToolDispatcher::new(catalog_path, Arc::new(StdioToolClient::default()))?;
    Ok(Arc::new(tokio::sync::Mutex::new(dispatcher)))
}

/// Factory and registry for tasks.
pub struct TaskManager {
    settings: Settings,
    envs: SharedEnvTable,
    bus: EventBus,
    client_manager: ClientManager,
    tips_manager: TipsManager,
    dispatcher: Option<SharedDispatcher>,
    diagnostics: Arc<dyn Diagnostics>,
    prompter: Arc<dyn Prompter>,
    api_prompt: String,
    workdir: PathBuf,
    recent: VecDeque<String>,
}

impl TaskManager {
    /// Most recent task ids retained.
    pub const MAX_TASKS: usize = 16;

    /// Assemble a manager.
    ///
    /// `tips_dir` points at the role/tips catalog; `dispatcher` enables tool
    /// dispatch when present (see [`stdio_dispatcher`]).  The `[mcp] enable`
    /// setting gates it off even when supplied.
    pub fn new(
        settings: Settings,
        tips_dir: Option<&Path>,
        dispatcher: Option<SharedDispatcher>,
        bus: EventBus,
        prompter: Arc<dyn Prompter>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<Self> {
        let workdir = match settings.workdir.as_deref() {
            Some(dir) => {
                let path = std::env::current_dir()?.join(dir);
                std::fs::create_dir_all(&path)?;
                path
            }
            None => std::env::current_dir()?,
        };

        let envs: SharedEnvTable = Arc::new(Mutex::new(EnvTable::new()));
        let api_prompt = seed_api_catalog(&settings, &envs);

        let client_manager = ClientManager::new(&settings)?;

        let mut tips_manager = TipsManager::new();
        if let Some(dir) = tips_dir {
            tips_manager.load_dir(dir);
        }
        if !tips_manager.use_role(&settings.role) {
            tracing::warn!(role = %settings.role, "configured role not found in tips catalog");
        }

        let dispatcher = if settings.mcp.enable { dispatcher } else { None };

        Ok(Self {
            settings,
            envs,
            bus,
            client_manager,
            tips_manager,
            dispatcher,
            diagnostics,
            prompter,
            api_prompt,
            workdir,
            recent: VecDeque::new(),
        })
    }

    /// Create a task with an immutable system-prompt snapshot.
    pub async fn new_task(&mut self) -> Result<Task> {
        let mut system_prompt = build_system_prompt(
            self.tips_manager.current(),
            &self.api_prompt,
            self.settings.system_prompt.as_deref(),
        );

        if let Some(dispatcher) = &self.dispatcher {
            let tools = dispatcher.lock().await.list_tools().await;
            if !tools.is_empty() {
                tracing::info!(count = tools.len(), "appending tool protocol to system prompt");
                let tools_json = serde_json::to_string(&tools)?;
                system_prompt = append_tool_protocol(&system_prompt, &tools_json);
            }
        }

        let runtime = Arc::new(ExecRuntime::new(
            Arc::clone(&self.envs),
            self.settings.auto_install,
            self.settings.auto_getenv,
            &self.settings.interpreter,
            Arc::clone(&self.prompter),
            self.bus.clone(),
        ));
        let runner = Runner::new(
            runtime,
            RunnerConfig {
                timeout: Duration::from_secs(self.settings.block_timeout),
                open_html_blocks: self.settings.open_html_blocks,
            },
        );

        let task = Task::new(
            self.client_manager.session(self.bus.clone()),
            runner,
            TaskContext {
                system_prompt: Some(system_prompt),
                max_rounds: self.settings.max_rounds,
                dispatcher: self.dispatcher.clone(),
                bus: self.bus.clone(),
                diagnostics: Arc::clone(&self.diagnostics),
                workdir: self.workdir.clone(),
            },
        );

        self.recent.push_back(task.task_id().to_owned());
        while self.recent.len() > Self::MAX_TASKS {
            self.recent.pop_front();
        }

        tracing::info!(task_id = %task.task_id(), "new task created");
        Ok(task)
    }

    /// Switch the LLM used by future tasks.  Returns false for unknown names.
    pub fn use_llm(&mut self, name: &str) -> bool {
        self.client_manager.use_client(name)
    }

    /// Switch the tips role used by future tasks.
    pub fn use_role(&mut self, name: &str) -> bool {
        self.tips_manager.use_role(name)
    }

    /// The shared env table (name → value/description).
    pub fn envs(&self) -> SharedEnvTable {
        Arc::clone(&self.envs)
    }

    /// Where task artifacts land.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Ids of recently created tasks, oldest first.
    pub fn recent_tasks(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    /// Names of the configured, usable LLM clients.
    pub fn llm_names(&self) -> Vec<&str> {
        self.client_manager.names()
    }
}

/// Render the API catalog segment and seed the env table from it.
fn seed_api_catalog(settings: &Settings, envs: &SharedEnvTable) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut table = envs.lock().unwrap_or_else(|e| e.into_inner());

    for (api_name, api) in &settings.api {
        lines.push(format!("## {api_name} API"));
        if let Some(desc) = &api.desc {
            lines.push(format!("### Description\n{desc}"));
        }
        if api.env.is_empty() {
            continue;
        }

        lines.push("### Environment variable names and meanings".to_owned());
        for (name, (value, desc)) in &api.env {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            lines.push(format!("- {name}: {desc}"));
            table.insert(
                name.clone(),
                EnvEntry {
                    value: value.to_owned(),
                    desc: desc.clone(),
                },
            );
        }
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
