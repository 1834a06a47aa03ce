//! The task loop.
//!
//! A [`Task`] drives the LLM↔runtime round-trip: send the instruction, parse
//! the reply into blocks / exec directives / a tool call, perform the local
//! action, feed the results back, and repeat until the model stops emitting
//! executable work, the round cap is hit, or a stop is requested.
//!
//! One round = one LLM turn plus at most one local action plus the feedback
//! send.  The loop invokes the provider at most `max_rounds` times per
//! `run()` call.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Value, json};
use uuid::Uuid;

use opentask_exec::{BlockRef, Runner};
use opentask_kernel::{EventBus, StopFlag, events};
use opentask_mcp::ToolDispatcher;

use crate::artifacts::{get_safe_filename, render_transcript};
use crate::blocks::{BlockRegistry, CodeBlock};
use crate::diagnose::Diagnostics;
use crate::history::Role;
use crate::llm::Client;

/// Shared handle to the dispatcher (calls need exclusive access, and the
/// manager keeps it across tasks).
pub type SharedDispatcher = Arc<tokio::sync::Mutex<ToolDispatcher>>;

/// Everything a task needs besides its client and runner.
pub struct TaskContext {
    /// Immutable system prompt snapshot for this task.
    pub system_prompt: Option<String>,
    /// Round cap per `run()` invocation.
    pub max_rounds: u32,
    /// Tool dispatcher, when dispatch is enabled for this task.
    pub dispatcher: Option<SharedDispatcher>,
    pub bus: EventBus,
    pub diagnostics: Arc<dyn Diagnostics>,
    /// Where task artifacts and block files land.
    pub workdir: PathBuf,
}

/// One task: an instruction, its conversation, its blocks, its runs.
pub struct Task {
    task_id: String,
    instruction: Option<String>,
    system_prompt: Option<String>,
    max_rounds: u32,
    client: Client,
    registry: Arc<Mutex<BlockRegistry>>,
    runner: Runner,
    dispatcher: Option<SharedDispatcher>,
    bus: EventBus,
    stop: StopFlag,
    diagnostics: Arc<dyn Diagnostics>,
    workdir: PathBuf,
    start_time: Option<Instant>,
}

impl Task {
    /// Create a task and wire the runner's code resolver to its registry.
    pub fn new(client: Client, runner: Runner, context: TaskContext) -> Self {
        let registry = Arc::new(Mutex::new(BlockRegistry::new()));

        let resolver_registry = Arc::clone(&registry);
        runner.runtime().set_code_resolver(Arc::new(move |id| {
            resolver_registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_code(id)
        }));

        Self {
            task_id: Uuid::new_v4().simple().to_string(),
            instruction: None,
            system_prompt: context.system_prompt,
            max_rounds: context.max_rounds,
            client,
            registry,
            runner,
            dispatcher: context.dispatcher,
            bus: context.bus,
            stop: StopFlag::new(),
            diagnostics: context.diagnostics,
            workdir: context.workdir,
            start_time: None,
        }
    }

    /// The task's 32-hex id.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The original instruction, once `run` has been called.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Handle for cooperative cancellation; observed between rounds.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// The conversation session.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The block runner (run history, persistent state).
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Drive the round loop for one instruction.
    ///
    /// The first invocation wraps the instruction in the user-prompt
    /// envelope and sends the system prompt; later invocations continue the
    /// same conversation with the bare instruction.
    pub async fn run(&mut self, instruction: &str) {
        tracing::info!(task_id = %self.task_id, "start processing instruction");

        let (first_prompt, system_prompt) = if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
            self.instruction = Some(instruction.to_owned());

            let envelope = self.build_user_prompt(instruction);
            self.bus.broadcast(events::TASK_START, envelope.clone());
            (envelope.to_string(), self.system_prompt.clone())
        } else {
            (instruction.to_owned(), None)
        };

        let mut llm_calls: u32 = 1;
        let mut response = self.chat(&first_prompt, system_prompt.as_deref()).await;

        while let Some(content) = response.take() {
            let Some(feedback) = self.process_reply(&content).await else {
                break;
            };
            if self.stop.is_stopped() {
                tracing::info!(task_id = %self.task_id, "task stopped");
                break;
            }
            if llm_calls >= self.max_rounds {
                tracing::info!(max_rounds = self.max_rounds, "round cap reached");
                break;
            }
            llm_calls += 1;
            response = self.chat(&feedback, None).await;
        }

        self.broadcast_summary();
        self.auto_save();
        tracing::info!(task_id = %self.task_id, llm_calls, "loop done");
    }

    /// Finalize the task: move artifacts to stable names, hand the run
    /// history to diagnostics, and emit the closing summary.
    pub fn done(&mut self) {
        let instruction = self.instruction.clone().unwrap_or_default();

        for extension in [".json", ".html"] {
            let current = self.workdir.join(format!("{}{extension}", self.task_id));
            if !current.exists() {
                continue;
            }
            let Some(target) = get_safe_filename(&self.workdir, &instruction, extension) else {
                continue;
            };
            match std::fs::rename(&current, &target) {
                Ok(()) => tracing::info!(file = %target.display(), "result file saved"),
                Err(e) => tracing::error!(error = %e, "failed to rename task artifact"),
            }
        }

        self.diagnostics.report_code_error(self.runner.history());
        self.broadcast_summary();
        tracing::info!(task_id = %self.task_id, "task done");
    }

    // -----------------------------------------------------------------------
    // Round internals
    // -----------------------------------------------------------------------

    /// Send one prompt; provider errors end the loop for this invocation.
    async fn chat(&mut self, prompt: &str, system_prompt: Option<&str>) -> Option<String> {
        let message = self.client.send(prompt, system_prompt).await;
        if message.role == Role::Error {
            tracing::error!(content = %message.content, "provider error, ending loop");
            return None;
        }
        Some(message.content)
    }

    /// Parse a reply and perform its local action.  Returns the feedback to
    /// send, or `None` when the reply contained no actionable work.
    async fn process_reply(&mut self, content: &str) -> Option<String> {
        let parse_tools = self.dispatcher.is_some();
        let result = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .parse(content, parse_tools);

        if result.is_empty() {
            return None;
        }

        if !result.errors.is_empty() {
            let errors = serde_json::to_value(&result.errors).unwrap_or_default();
            self.bus.broadcast(events::RESULT, errors);
            let rendered = serde_json::to_string_pretty(&result).unwrap_or_default();
            return Some(format!("# Message parse errors\n{rendered}"));
        }

        if !result.exec_blocks.is_empty() {
            return Some(self.process_code_reply(&result.exec_blocks).await);
        }

        if let Some(call) = result.tool_call {
            return Some(self.process_tool_reply(call).await);
        }

        // Blocks were defined but nothing asked to run: the model is done.
        None
    }

    /// Execute blocks in directive order and build the feedback document.
    async fn process_code_reply(&mut self, exec_blocks: &[CodeBlock]) -> String {
        let mut results: Vec<Value> = Vec::with_capacity(exec_blocks.len());

        for block in exec_blocks {
            self.bus
                .broadcast(events::EXEC, json!({"id": block.id, "lang": block.lang}));

            let result = self
                .runner
                .run(BlockRef {
                    id: &block.id,
                    lang: &block.lang,
                    code: &block.code,
                    path: block.path.as_deref(),
                })
                .await;

            let mut value = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            value["block_id"] = json!(block.id);
            self.bus.broadcast(events::RESULT, value.clone());
            results.push(value);
        }

        // A single result is embedded bare; several become an array.
        let payload = if results.len() == 1 {
            results.into_iter().next().unwrap_or_default()
        } else {
            Value::Array(results)
        };
        let rendered = serde_json::to_string_pretty(&payload).unwrap_or_default();

        format!(
            "# Original task\n{}\n\n# Code execution results\n{rendered}",
            self.instruction.as_deref().unwrap_or_default()
        )
    }

    /// Dispatch an extracted tool call and build the feedback document.
    ///
    /// The call JSON is threaded through the `tool_call` pipeline first so
    /// subscribers may rewrite it.
    async fn process_tool_reply(&mut self, call_json: String) -> String {
        let mut payload = json!({"content": call_json, "language": "json"});
        self.bus.pipeline(events::TOOL_CALL, &mut payload);
        let rewritten = payload["content"]
            .as_str()
            .map(str::to_owned)
            .unwrap_or(call_json);

        let outcome = match serde_json::from_str::<Value>(&rewritten) {
            Ok(call) => {
                let name = call["name"].as_str().unwrap_or_default().to_owned();
                let arguments = call
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                match &self.dispatcher {
                    Some(dispatcher) => {
                        tracing::info!(tool = %name, "calling external tool");
                        match dispatcher.lock().await.call_tool(&name, &arguments).await {
                            Ok(result) => result,
                            Err(e) => {
                                tracing::error!(tool = %name, error = %e, "tool call failed");
                                json!({"error": e.to_string()})
                            }
                        }
                    }
                    None => json!({"error": "tool dispatch is not enabled"}),
                }
            }
            Err(e) => json!({"error": format!("invalid tool call json: {e}")}),
        };

        self.bus.broadcast(events::RESULT, outcome.clone());
        let rendered = serde_json::to_string_pretty(&outcome).unwrap_or_default();

        format!(
            "# MCP invocation\n{}\n\n# Execution result\n````json\n{rendered}\n````",
            self.instruction.as_deref().unwrap_or_default()
        )
    }

    /// The compact JSON envelope sent as the first user turn.
    fn build_user_prompt(&self, instruction: &str) -> Value {
        json!({
            "task": instruction,
            "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            "today": chrono::Local::now().format("%Y-%m-%d").to_string(),
            "locale": std::env::var("LANG").ok(),
            "work_dir": "The working directory is the current directory; create files there by default.",
            "reply_language": "Always think and reply in the language the user's query is written in.",
        })
    }

    fn broadcast_summary(&self) {
        let summary = self.client.history().get_summary();
        let elapsed = self
            .start_time
            .map_or(0.0, |start| start.elapsed().as_secs_f64());
        let line = format!(
            "| {} | {:.3}s/{elapsed:.3}s | Tokens: {}/{}/{}",
            summary.rounds,
            summary.time,
            summary.input_tokens,
            summary.output_tokens,
            summary.total_tokens
        );
        self.bus.broadcast(events::SUMMARY, json!(line));
    }

    /// The serializable snapshot persisted as the task's JSON artifact.
    fn snapshot(&self) -> Value {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "instruction": self.instruction,
            "chats": self.client.history().messages(),
            "runner_history": self.runner.history(),
            "blocks": registry.blocks(),
        })
    }

    fn auto_save(&self) {
        let task = self.snapshot();

        let json_path = self.workdir.join(format!("{}.json", self.task_id));
        match serde_json::to_string_pretty(&task) {
            Ok(rendered) => {
                if let Err(e) = std::fs::write(&json_path, rendered) {
                    tracing::error!(error = %e, "failed to save task json");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize task"),
        }

        let html_path = self.workdir.join(format!("{}.html", self.task_id));
        if let Err(e) = std::fs::write(&html_path, render_transcript(&task)) {
            tracing::error!(error = %e, "failed to save task transcript");
        }

        tracing::info!(task_id = %self.task_id, "task auto saved");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use opentask_exec::{DenyPrompter, EnvTable, ExecRuntime, RunnerConfig};

    use super::*;
    use crate::error::Result;
    use crate::history::{ChatMessage, WireMessage};
    use crate::llm::stream::StreamSink;
    use crate::llm::ChatClient;

    /// Provider that replays a fixed list of replies.
    struct ScriptedClient {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn usable(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            _messages: &[WireMessage],
            _system_prompt: Option<&str>,
            _sink: &mut StreamSink,
        ) -> Result<ChatMessage> {
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.is_empty() {
                String::new()
            } else {
                replies.remove(0)
            };
            Ok(ChatMessage::new(Role::Assistant, content))
        }
    }

    fn scripted_task(replies: Vec<&str>, max_rounds: u32, workdir: PathBuf) -> Task {
        let bus = EventBus::new();
        let client = Client::new(
            Arc::new(ScriptedClient {
                replies: Mutex::new(replies.into_iter().map(str::to_owned).collect()),
            }),
            bus.clone(),
        );
        let runtime = Arc::new(ExecRuntime::new(
            Arc::new(Mutex::new(EnvTable::new())),
            false,
            true,
            // Nonexistent on purpose: execution failures fold into errstr and
            // the loop keeps going, which is all these tests need.
            "/nonexistent/interpreter",
            Arc::new(DenyPrompter),
            bus.clone(),
        ));
        let runner = Runner::new(runtime, RunnerConfig::default());

        Task::new(
            client,
            runner,
            TaskContext {
                system_prompt: Some("system rules".into()),
                max_rounds,
                dispatcher: None,
                bus,
                diagnostics: Arc::new(crate::diagnose::NoopDiagnostics),
                workdir,
            },
        )
    }

    fn exec_reply(id: &str) -> String {
        format!(
            "<!-- Block-Start: {{\"id\":\"{id}\"}} -->\n```python\nprint(1)\n```\n<!-- Block-End: {{\"id\":\"{id}\"}} -->\n<!-- Cmd-Exec: {{\"id\":\"{id}\"}} -->\n"
        )
    }

    #[tokio::test]
    async fn plain_reply_ends_after_one_round() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = scripted_task(vec!["all done, nothing to run"], 4, dir.path().into());

        task.run("say hi").await;

        let summary = task.client().history().get_summary();
        assert_eq!(summary.rounds, 1);
        assert!(task.runner().history().is_empty());
    }

    #[tokio::test]
    async fn round_cap_limits_llm_calls() {
        let dir = tempfile::tempdir().unwrap();
        // Every reply asks to execute; with max_rounds = 2 only two provider
        // calls may happen.
        let mut task = scripted_task(
            vec![&exec_reply("b1"), &exec_reply("b2"), &exec_reply("b3")],
            2,
            dir.path().into(),
        );

        task.run("loop forever").await;

        assert_eq!(task.client().history().get_summary().rounds, 2);
        // Both replies executed their block before the cap kicked in.
        assert_eq!(task.runner().history().len(), 2);
    }

    #[tokio::test]
    async fn stop_flag_breaks_the_loop_between_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = scripted_task(
            vec![&exec_reply("b1"), &exec_reply("b2")],
            8,
            dir.path().into(),
        );
        task.stop_flag().stop();

        task.run("stop early").await;

        // The first reply is processed, then the stop is observed before the
        // feedback send.
        assert_eq!(task.client().history().get_summary().rounds, 1);
    }

    #[tokio::test]
    async fn parse_errors_become_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let duplicate = format!(
            "{}{}",
            exec_reply("x"),
            "<!-- Block-Start: {\"id\":\"x\"} -->\n```python\nagain\n```\n<!-- Block-End: {\"id\":\"x\"} -->\n"
        );
        let mut task = scripted_task(vec![&duplicate, "ok, understood"], 4, dir.path().into());

        task.run("dup test").await;

        // Second user turn carries the parse-error feedback.
        let messages = task.client().history().messages();
        let feedback = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .nth(1)
            .expect("feedback turn");
        assert!(feedback.content.starts_with("# Message parse errors"));
        assert!(feedback.content.contains("duplicate_id"));
    }

    #[tokio::test]
    async fn execution_feedback_carries_block_id_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let reply = "\
<!-- Block-Start: {\"id\":\"a\"} -->\n```python\n1\n```\n<!-- Block-End: {\"id\":\"a\"} -->\n\
<!-- Block-Start: {\"id\":\"b\"} -->\n```python\n2\n```\n<!-- Block-End: {\"id\":\"b\"} -->\n\
<!-- Cmd-Exec: {\"id\":\"b\"} -->\n<!-- Cmd-Exec: {\"id\":\"a\"} -->\n";
        let mut task = scripted_task(vec![reply, "done"], 4, dir.path().into());

        task.run("ordered").await;

        let history: Vec<&str> = task
            .runner()
            .history()
            .iter()
            .map(|r| r.block_id.as_str())
            .collect();
        assert_eq!(history, vec!["b", "a"]);

        let messages = task.client().history().messages();
        let feedback = &messages
            .iter()
            .filter(|m| m.role == Role::User)
            .nth(1)
            .unwrap()
            .content;
        assert!(feedback.starts_with("# Original task\nordered"));
        let b_pos = feedback.find("\"block_id\": \"b\"").unwrap();
        let a_pos = feedback.find("\"block_id\": \"a\"").unwrap();
        assert!(b_pos < a_pos, "feedback must preserve execution order");
    }

    #[tokio::test]
    async fn artifacts_are_written_and_renamed_by_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = scripted_task(vec!["nothing to do"], 4, dir.path().into());

        task.run("make a report").await;
        assert!(dir.path().join(format!("{}.json", task.task_id())).exists());
        assert!(dir.path().join(format!("{}.html", task.task_id())).exists());

        task.done();
        assert!(dir.path().join("make a report.json").exists());
        assert!(dir.path().join("make a report.html").exists());
        assert!(!dir.path().join(format!("{}.json", task.task_id())).exists());
    }

    #[tokio::test]
    async fn task_start_event_carries_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut task = scripted_task(vec!["done"], 4, dir.path().into());
        // Bus handles share one table, so registering on a clone works.
        let sink = Arc::clone(&seen);
        let bus = task.bus.clone();
        bus.register(events::TASK_START, move |data| {
            sink.lock().unwrap().push(data.clone());
            None
        });

        task.run("envelope test").await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["task"], "envelope test");
        assert!(seen[0]["today"].is_string());
        assert!(seen[0]["platform"].is_string());
    }
}
