//! End-to-end task-loop scenarios with a scripted provider and an in-memory
//! tool transport.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use opentask_agent::llm::stream::StreamSink;
use opentask_agent::{
    ChatClient, ChatMessage, Client, Role, Task, TaskContext, WireMessage,
};
use opentask_exec::{DenyPrompter, EnvTable, ExecRuntime, Runner, RunnerConfig};
use opentask_kernel::{EventBus, events};
use opentask_mcp::{ServerConfig, ToolDescriptor, ToolDispatcher};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

struct ScriptedClient {
    replies: Mutex<Vec<Result<String, String>>>,
    prompts_seen: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_owned).map_err(str::to_owned))
                    .collect(),
            ),
            prompts_seen: Mutex::new(Vec::new()),
        })
    }
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
        messages: &[WireMessage],
        _system_prompt: Option<&str>,
        sink: &mut StreamSink,
    ) -> opentask_agent::Result<ChatMessage> {
        if let Some(last) = messages.last() {
            self.prompts_seen.lock().unwrap().push(last.content.clone());
        }
        let mut replies = self.replies.lock().unwrap();
        let next = if replies.is_empty() {
            Ok(String::new())
        } else {
            replies.remove(0)
        };
        match next {
            Ok(content) => {
                sink.push(&content, false);
                sink.finish();
                Ok(ChatMessage::new(Role::Assistant, content))
            }
            Err(reason) => Err(opentask_agent::AgentError::RequestFailed { reason }),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory tool transport
// ---------------------------------------------------------------------------

struct RecordingToolClient {
    tools: BTreeMap<String, Vec<ToolDescriptor>>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl opentask_mcp::ToolClient for RecordingToolClient {
    async fn list_tools(
        &self,
        server: &str,
        _config: &ServerConfig,
    ) -> opentask_mcp::Result<Vec<ToolDescriptor>> {
        Ok(self.tools.get(server).cloned().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        server: &str,
        _config: &ServerConfig,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> opentask_mcp::Result<Value> {
        self.calls.lock().unwrap().push((
            server.to_owned(),
            tool.to_owned(),
            Value::Object(arguments.clone()),
        ));
        Ok(json!({"content": [{"type": "text", "text": "tool output"}], "isError": false}))
    }
}

fn search_dispatcher(
    dir: &std::path::Path,
) -> (Arc<tokio::sync::Mutex<ToolDispatcher>>, Arc<RecordingToolClient>) {
    let catalog = dir.join("tools.json");
    std::fs::write(
        &catalog,
        r#"{"mcpServers": {"search-server": {"command": "search-bin"}}}"#,
    )
    .unwrap();

    let mut tools = BTreeMap::new();
    tools.insert(
        "search-server".to_owned(),
        vec![ToolDescriptor {
            name: "search".into(),
            description: Some("Search the web".into()),
            input_schema: json!({"properties": {"q": {"type": "string"}}, "required": ["q"]}),
            server: "search-server".into(),
        }],
    );
    let client = Arc::new(RecordingToolClient {
        tools,
        calls: Mutex::new(Vec::new()),
    });

    let mut dispatcher =
        ToolDispatcher::new(&catalog, Arc::clone(&client) as Arc<dyn opentask_mcp::ToolClient>)
            .unwrap();
    dispatcher.set_globally_enabled(true);
    (Arc::new(tokio::sync::Mutex::new(dispatcher)), client)
}

// ---------------------------------------------------------------------------
// Task assembly
// ---------------------------------------------------------------------------

fn build_task(
    provider: Arc<ScriptedClient>,
    dispatcher: Option<Arc<tokio::sync::Mutex<ToolDispatcher>>>,
    bus: EventBus,
    workdir: PathBuf,
) -> Task {
    let runtime = Arc::new(ExecRuntime::new(
        Arc::new(Mutex::new(EnvTable::new())),
        false,
        true,
        "/nonexistent/interpreter",
        Arc::new(DenyPrompter),
        bus.clone(),
    ));
    let runner = Runner::new(runtime, RunnerConfig::default());

    Task::new(
        Client::new(provider, bus.clone()),
        runner,
        TaskContext {
            system_prompt: Some("system".into()),
            max_rounds: 8,
            dispatcher,
            bus,
            diagnostics: Arc::new(opentask_agent::NoopDiagnostics),
            workdir,
        },
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_call_fallback_routes_to_the_offering_server() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tool_client) = search_dispatcher(dir.path());

    let provider = ScriptedClient::new(vec![
        Ok(r#"I need to search.
```json
{"action": "call_tool", "name": "search", "arguments": {"q": "x"}}
```"#),
        Ok("Found it, we're done."),
    ]);

    let mut task = build_task(
        Arc::clone(&provider),
        Some(dispatcher),
        EventBus::new(),
        dir.path().into(),
    );
    task.run("find x").await;

    // The dispatcher routed to the server offering `search`.
    let calls = tool_client.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "search-server");
    assert_eq!(calls[0].1, "search");
    assert_eq!(calls[0].2["q"], "x");

    // The wrapped structured result flowed back as feedback.
    let prompts = provider.prompts_seen.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].starts_with("# MCP invocation\nfind x"));
    assert!(prompts[1].contains("# Execution result"));
    assert!(prompts[1].contains("tool output"));
}

#[tokio::test]
async fn tool_call_pipeline_may_rewrite_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tool_client) = search_dispatcher(dir.path());
    let bus = EventBus::new();

    // A subscriber rewrites the query before dispatch.
    bus.register(events::TOOL_CALL, |data| {
        let call: Value =
            serde_json::from_str(data["content"].as_str().unwrap_or_default()).ok()?;
        let mut call = call;
        call["arguments"]["q"] = json!("rewritten");
        data["content"] = json!(call.to_string());
        None
    });

    let provider = ScriptedClient::new(vec![
        Ok(r#"{"action": "call_tool", "name": "search", "arguments": {"q": "original"}}"#),
        Ok("done"),
    ]);

    let mut task = build_task(provider, Some(dispatcher), bus, dir.path().into());
    task.run("rewrite test").await;

    let calls = tool_client.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2["q"], "rewritten");
}

#[tokio::test]
async fn tool_extraction_is_off_without_a_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedClient::new(vec![Ok(
        r#"{"action": "call_tool", "name": "search", "arguments": {"q": "x"}}"#,
    )]);

    let mut task = build_task(Arc::clone(&provider), None, EventBus::new(), dir.path().into());
    task.run("no tools").await;

    // With no dispatcher the reply parses to nothing actionable: one round.
    assert_eq!(provider.prompts_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn provider_error_ends_the_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedClient::new(vec![Err("503 service unavailable")]);

    let mut task = build_task(Arc::clone(&provider), None, EventBus::new(), dir.path().into());
    task.run("doomed").await;

    let summary = task.client().history().get_summary();
    assert_eq!(summary.rounds, 0);
    // The user turn stays; no assistant message was appended.
    assert_eq!(task.client().history().len(), 2); // system + user
}

#[tokio::test]
async fn exec_rounds_emit_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for event in [events::TASK_START, events::EXEC, events::RESULT, events::SUMMARY] {
        let sink = Arc::clone(&order);
        bus.register(event, move |_| {
            sink.lock().unwrap().push(event);
            None
        });
    }

    let provider = ScriptedClient::new(vec![
        Ok("<!-- Block-Start: {\"id\":\"b1\"} -->\n```python\nprint(1)\n```\n<!-- Block-End: {\"id\":\"b1\"} -->\n<!-- Cmd-Exec: {\"id\":\"b1\"} -->"),
        Ok("finished"),
    ]);

    let mut task = build_task(provider, None, bus, dir.path().into());
    task.run("events").await;

    let order = order.lock().unwrap();
    assert_eq!(
        order.as_slice(),
        &[
            events::TASK_START,
            events::EXEC,
            events::RESULT,
            events::SUMMARY
        ]
    );
}

#[tokio::test]
async fn second_run_continues_the_same_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedClient::new(vec![Ok("first answer"), Ok("second answer")]);

    let mut task = build_task(Arc::clone(&provider), None, EventBus::new(), dir.path().into());
    task.run("initial instruction").await;
    task.run("follow-up instruction").await;

    let prompts = provider.prompts_seen.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    // First prompt is the JSON envelope; the follow-up goes through bare.
    assert!(prompts[0].contains("\"task\":\"initial instruction\""));
    assert_eq!(prompts[1], "follow-up instruction");

    assert_eq!(task.client().history().get_summary().rounds, 2);
}
