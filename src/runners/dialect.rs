// src/runners/dialect.rs
//! Command lines and JSON-line event formats of the supported agent CLIs
//!
//! | Runner        | Command                                  | Resume key   |
//! |---------------|------------------------------------------|--------------|
//! | `claude-code` | `claude -p … --output-format stream-json`| `session_id` |
//! | `codex`       | `codex exec --json …`                    | `thread_id`  |
//! | `opencode`    | `opencode run --format json …`           | `session_id` |

use crate::model::{RunnerKind, Usage};
use crate::runners::{LaunchParams, RunnerEvent, RunnerEventKind};
use serde_json::{json, Value};

/// Output dialect of an agent CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    ClaudeCode,
    Codex,
    OpenCode,
}

impl Dialect {
    pub fn for_kind(kind: RunnerKind) -> Option<Self> {
        match kind {
            RunnerKind::ClaudeCode => Some(Dialect::ClaudeCode),
            RunnerKind::Codex => Some(Dialect::Codex),
            RunnerKind::OpenCode => Some(Dialect::OpenCode),
            RunnerKind::Stub => None,
        }
    }

    pub fn kind(&self) -> RunnerKind {
        match self {
            Dialect::ClaudeCode => RunnerKind::ClaudeCode,
            Dialect::Codex => RunnerKind::Codex,
            Dialect::OpenCode => RunnerKind::OpenCode,
        }
    }

    /// Checkpoint field holding the agent's resumable session
    pub fn resume_key(&self) -> &'static str {
        match self {
            Dialect::Codex => "thread_id",
            Dialect::ClaudeCode | Dialect::OpenCode => "session_id",
        }
    }

    /// Arguments for one non-interactive invocation
    pub fn args(&self, params: &LaunchParams) -> Vec<String> {
        let profile = &params.profile;
        let resume = params
            .resume_from
            .as_ref()
            .and_then(|c| c.payload.get(self.resume_key()))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut args: Vec<String> = Vec::new();
        match self {
            Dialect::ClaudeCode => {
                option(&mut args, "-p", &params.task.prompt);
                option(&mut args, "--output-format", "stream-json");
                args.push("--verbose".to_string());
                if let Some(model) = &profile.model {
                    option(&mut args, "--model", model);
                }
                if let Some(max_turns) = profile.max_turns {
                    option(&mut args, "--max-turns", &max_turns.to_string());
                }
                if !profile.allowed_tools.is_empty() {
                    option(&mut args, "--allowedTools", &profile.allowed_tools.join(","));
                }
                if let Some(session) = &resume {
                    option(&mut args, "--resume", session);
                }
            }
            Dialect::Codex => {
                args.extend(["exec", "--json", "--skip-git-repo-check"].map(String::from));
                if let Some(model) = &profile.model {
                    option(&mut args, "--model", model);
                }
                if let Some(thread) = &resume {
                    option(&mut args, "resume", thread);
                }
                args.push(params.task.prompt.clone());
            }
            Dialect::OpenCode => {
                args.extend(["run", "--format", "json"].map(String::from));
                if let Some(model) = &profile.model {
                    option(&mut args, "--model", model);
                }
                if let Some(session) = &resume {
                    option(&mut args, "--session", session);
                }
                args.push(params.task.prompt.clone());
            }
        }
        args
    }
}

/// Stateful stdout parser for one runner process
#[derive(Debug)]
pub struct LineParser {
    dialect: Dialect,

    /// Inside an assistant message sequence (Claude turns span several lines)
    in_turn: bool,
}

impl LineParser {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            in_turn: false,
        }
    }

    /// Map one stdout line to runner events; non-JSON lines become output
    pub fn parse(&mut self, line: &str) -> Vec<RunnerEvent> {
        let line = line.trim();
        if line.is_empty() {
            return vec![];
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => return vec![RunnerEvent::new(RunnerEventKind::Output, json!({ "raw": line }))],
        };

        match self.dialect {
            Dialect::ClaudeCode => self.parse_claude(&value),
            Dialect::Codex => parse_codex(&value),
            Dialect::OpenCode => parse_opencode(&value),
        }
    }

    /// system → session init, assistant → text/tool_use blocks under
    /// `message.content`, user → tool_result blocks, result → final summary
    fn parse_claude(&mut self, value: &Value) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        let session = value.get("session_id").and_then(Value::as_str);

        match str_field(value, "type") {
            "system" => {
                let mut event = RunnerEvent::new(
                    RunnerEventKind::Progress,
                    json!({ "subtype": value.get("subtype"), "model": value.get("model") }),
                );
                if let Some(session) = session {
                    event = event.with_checkpoint(json!({ "session_id": session }));
                }
                events.push(event);
            }
            "assistant" => {
                if !self.in_turn {
                    self.in_turn = true;
                    events.push(RunnerEvent::new(RunnerEventKind::TurnStarted, json!({})));
                }
                for block in content_blocks(value) {
                    match str_field(block, "type") {
                        "text" => events.push(RunnerEvent::new(
                            RunnerEventKind::Output,
                            json!({ "text": block.get("text") }),
                        )),
                        "tool_use" => events.push(RunnerEvent::new(
                            RunnerEventKind::ToolInvoked,
                            json!({
                                "tool": block.get("name"),
                                "id": block.get("id"),
                                "input": block.get("input"),
                            }),
                        )),
                        _ => {}
                    }
                }
            }
            "user" => {
                self.in_turn = false;
                for block in content_blocks(value) {
                    if str_field(block, "type") == "tool_result" {
                        events.push(RunnerEvent::new(
                            RunnerEventKind::ToolResult,
                            json!({
                                "tool_use_id": block.get("tool_use_id"),
                                "content": block.get("content"),
                            }),
                        ));
                    }
                }
            }
            "result" => {
                self.in_turn = false;
                let usage = value.get("usage").map(|u| Usage {
                    input_tokens: u64_field(u, "input_tokens"),
                    output_tokens: u64_field(u, "output_tokens"),
                    cost_usd: value
                        .get("total_cost_usd")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                });
                let mut event = RunnerEvent::new(
                    RunnerEventKind::Progress,
                    json!({
                        "subtype": value.get("subtype"),
                        "num_turns": value.get("num_turns"),
                        "duration_ms": value.get("duration_ms"),
                    }),
                );
                if let Some(usage) = usage {
                    event = event.with_usage(usage);
                }
                if let Some(session) = session {
                    event = event.with_checkpoint(json!({ "session_id": session }));
                }
                events.push(event);

                if value.get("is_error").and_then(Value::as_bool) == Some(true) {
                    events.push(RunnerEvent::new(
                        RunnerEventKind::Failure,
                        json!({ "reason": "runner_error", "detail": value.get("result") }),
                    ));
                }
            }
            _ => {}
        }
        events
    }
}

fn parse_codex(value: &Value) -> Vec<RunnerEvent> {
    let item = value.get("item").unwrap_or(&Value::Null);
    let event = match str_field(value, "type") {
        "thread.started" => {
            let thread = value.get("thread_id").cloned().unwrap_or(Value::Null);
            RunnerEvent::new(RunnerEventKind::Progress, json!({ "thread_id": thread }))
                .with_checkpoint(json!({ "thread_id": thread }))
        }
        "turn.started" => RunnerEvent::new(RunnerEventKind::TurnStarted, json!({})),
        "item.started" => match str_field(item, "type") {
            "command_execution" | "mcp_tool_call" | "file_change" => {
                RunnerEvent::new(RunnerEventKind::ToolInvoked, item.clone())
            }
            _ => return vec![],
        },
        "item.completed" => match str_field(item, "type") {
            "agent_message" => RunnerEvent::new(
                RunnerEventKind::Output,
                json!({ "text": item.get("text") }),
            ),
            "command_execution" | "mcp_tool_call" | "file_change" => {
                RunnerEvent::new(RunnerEventKind::ToolResult, item.clone())
            }
            _ => RunnerEvent::new(RunnerEventKind::Progress, item.clone()),
        },
        "turn.completed" => {
            let usage = value.get("usage").unwrap_or(&Value::Null);
            RunnerEvent::new(RunnerEventKind::Progress, json!({ "usage": usage })).with_usage(Usage {
                input_tokens: u64_field(usage, "input_tokens"),
                output_tokens: u64_field(usage, "output_tokens"),
                cost_usd: 0.0,
            })
        }
        "turn.failed" => RunnerEvent::new(
            RunnerEventKind::Failure,
            json!({ "reason": "runner_error", "detail": value.pointer("/error/message") }),
        ),
        "error" => RunnerEvent::new(
            RunnerEventKind::Failure,
            json!({ "reason": "runner_error", "detail": value.get("message") }),
        ),
        _ => return vec![],
    };
    vec![event]
}

fn parse_opencode(value: &Value) -> Vec<RunnerEvent> {
    let part = value.get("part").unwrap_or(&Value::Null);
    let event = match str_field(value, "type") {
        "step_start" => {
            let mut event = RunnerEvent::new(RunnerEventKind::TurnStarted, json!({}));
            if let Some(session) = value.get("sessionID").and_then(Value::as_str) {
                event = event.with_checkpoint(json!({ "session_id": session }));
            }
            event
        }
        "text" => RunnerEvent::new(RunnerEventKind::Output, json!({ "text": part.get("text") })),
        "tool_use" => {
            let status = part.pointer("/state/status").and_then(Value::as_str);
            let kind = match status {
                Some("completed") | Some("error") => RunnerEventKind::ToolResult,
                _ => RunnerEventKind::ToolInvoked,
            };
            RunnerEvent::new(
                kind,
                json!({ "tool": part.get("tool"), "state": part.get("state") }),
            )
        }
        "step_finish" => {
            let tokens = part.get("tokens").unwrap_or(&Value::Null);
            RunnerEvent::new(RunnerEventKind::Progress, json!({ "reason": part.get("reason") }))
                .with_usage(Usage {
                    input_tokens: u64_field(tokens, "input"),
                    output_tokens: u64_field(tokens, "output"),
                    cost_usd: part.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
                })
        }
        "error" => RunnerEvent::new(
            RunnerEventKind::Failure,
            json!({ "reason": "runner_error", "detail": value.get("error") }),
        ),
        _ => return vec![],
    };
    vec![event]
}

fn option(args: &mut Vec<String>, name: &str, value: &str) {
    args.push(name.to_string());
    args.push(value.to_string());
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}
