use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub model: String,         // free-form, e.g. "gpt-4o" or "computer-use-preview"
    pub display: (u32, u32),
    pub environment: String,   // "browser"
}

impl LlmConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            display: (1280, 800),
            environment: "browser".into(),
        }
    }

    /// Read credentials from the process environment, bound to `model`.
    pub fn from_env(model: impl Into<String>) -> Self {
        Self::new(
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            env::var("OPENAI_API_KEY").unwrap_or_default(),
            model,
        )
    }

    /// Computer-use models drive the browser from screenshots through the hosted tool.
    pub fn is_computer_use(&self) -> bool {
        self.model.contains("computer-use")
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseId(pub String);

#[derive(Debug, Default)]
pub struct TurnInput {
    pub instructions: String,
    pub observation: String,
}

#[derive(Debug)]
pub enum LlmOutput {
    Message {
        text: String,
        response_id: ResponseId,
    },
    FunctionCall {
        call_id: String,
        name: String,
        /// Decoded arguments, or why they could not be decoded.
        arguments: std::result::Result<Value, String>,
        response_id: ResponseId,
    },
    ComputerCall {
        call_id: String,
        action: ComputerAction,
        response_id: ResponseId,
        safety_checks: Vec<Value>,
    },
    Done {
        response_id: ResponseId,
    },
}

/// Actions issued by the hosted computer-use tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputerAction {
    Screenshot,
    Click { x: i64, y: i64, button: Option<String> },
    DoubleClick { x: i64, y: i64 },
    Move { x: i64, y: i64 },
    Scroll { dx: i64, dy: i64 },
    Type { text: String },
    Keypress { key: String },
    WaitMs { ms: i64 },
    Unknown(String),
}

/// What gets sent back for a pending tool call.
#[derive(Debug)]
pub enum ToolOutput {
    Text(String),
    Screenshot {
        data_base64: String,
        safety_checks: Vec<Value>,
    },
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    pub async fn turn(&self, input: TurnInput, previous: Option<&ResponseId>) -> Result<LlmOutput> {
        let req = self.turn_request(input, previous);
        self.post(req).await
    }

    pub async fn send_tool_output(
        &self,
        call_id: &str,
        output: ToolOutput,
        previous: Option<&ResponseId>,
    ) -> Result<LlmOutput> {
        let req = self.tool_output_request(call_id, output, previous);
        self.post(req).await
    }

    async fn post(&self, req: Value) -> Result<LlmOutput> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        debug!(model = %self.cfg.model, %url, "responses request");
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("OpenAI error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse OpenAI response JSON")?;
        Self::parse_output(v)
    }

    fn turn_request(&self, input: TurnInput, previous: Option<&ResponseId>) -> Value {
        let mut req = json!({
          "model": self.cfg.model,
          "truncation": "auto",
          "tools": self.tools(),
          "parallel_tool_calls": false,
          "input": [
            { "role": "user", "content": [
                { "type": "input_text", "text": input.instructions },
                { "type": "input_text", "text": input.observation }
            ]}
          ]
        });
        if let Some(prev) = previous {
            req["previous_response_id"] = Value::String(prev.0.clone());
        }
        req
    }

    fn tool_output_request(&self, call_id: &str, output: ToolOutput, previous: Option<&ResponseId>) -> Value {
        let item = match output {
            ToolOutput::Text(text) => json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": text
            }),
            ToolOutput::Screenshot { data_base64, safety_checks } => json!({
                "type": "computer_call_output",
                "call_id": call_id,
                "output": {
                  "type": "input_image",
                  "image_url": format!("data:image/png;base64,{}", data_base64)
                },
                "acknowledged_safety_checks": safety_checks
            }),
        };
        let mut req = json!({
          "model": self.cfg.model,
          "truncation": "auto",
          "tools": self.tools(),
          "parallel_tool_calls": false,
          "input": [item]
        });
        if let Some(prev) = previous {
            req["previous_response_id"] = Value::String(prev.0.clone());
        }
        req
    }

    fn tools(&self) -> Value {
        if self.cfg.is_computer_use() {
            json!([{
                "type": "computer_use_preview",
                "display_width": self.cfg.display.0,
                "display_height": self.cfg.display.1,
                "environment": self.cfg.environment
            }])
        } else {
            browser_functions()
        }
    }

    fn parse_output(v: Value) -> Result<LlmOutput> {
        // The Responses API returns: { id, output: [ ... ], status }
        let response_id = v
            .get("id")
            .and_then(|x| x.as_str())
            .map(|s| ResponseId(s.to_string()))
            .context("missing id")?;

        let outputs = v
            .get("output")
            .and_then(|x| x.as_array())
            .cloned()
            .unwrap_or_default();

        // Tool calls take priority over messages
        let mut pending_message: Option<String> = None;
        for o in &outputs {
            match o.get("type").and_then(|x| x.as_str()) {
                Some("computer_call") => {
                    let call_id = o
                        .get("call_id")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let action = o
                        .get("action")
                        .map(Self::decode_action)
                        .unwrap_or(ComputerAction::Unknown("unknown".into()));
                    let safety_checks = o
                        .get("pending_safety_checks")
                        .and_then(|x| x.as_array())
                        .cloned()
                        .unwrap_or_default();
                    return Ok(LlmOutput::ComputerCall { call_id, action, response_id, safety_checks });
                }
                Some("function_call") => {
                    let call_id = o
                        .get("call_id")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = o
                        .get("name")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string();
                    // arguments arrive as a JSON-encoded string
                    let arguments = match o.get("arguments") {
                        Some(Value::String(s)) if !s.trim().is_empty() => serde_json::from_str(s)
                            .map_err(|e| format!("invalid arguments for {name}: {e}")),
                        Some(Value::Object(m)) => Ok(Value::Object(m.clone())),
                        _ => Ok(json!({})),
                    };
                    return Ok(LlmOutput::FunctionCall { call_id, name, arguments, response_id });
                }
                Some("message") => {
                    let text = o
                        .get("content")
                        .and_then(|x| x.as_array())
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    if !text.is_empty() {
                        pending_message = Some(text);
                    }
                }
                _ => {}
            }
        }

        match pending_message {
            Some(text) => Ok(LlmOutput::Message { text, response_id }),
            None => Ok(LlmOutput::Done { response_id }),
        }
    }

    fn decode_action(v: &Value) -> ComputerAction {
        let int = |k: &str| v.get(k).and_then(|x| x.as_i64()).unwrap_or(0);
        let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
        match kind {
            "screenshot" => ComputerAction::Screenshot,
            "click" => ComputerAction::Click {
                x: int("x"),
                y: int("y"),
                button: v.get("button").and_then(|x| x.as_str()).map(|s| s.to_string()),
            },
            "double_click" => ComputerAction::DoubleClick { x: int("x"), y: int("y") },
            "move" => ComputerAction::Move { x: int("x"), y: int("y") },
            "scroll" => ComputerAction::Scroll {
                dx: v.get("scroll_x").or_else(|| v.get("dx")).and_then(|x| x.as_i64()).unwrap_or(0),
                dy: v.get("scroll_y").or_else(|| v.get("dy")).and_then(|x| x.as_i64()).unwrap_or(0),
            },
            "type" => ComputerAction::Type {
                text: v.get("text").and_then(|x| x.as_str()).unwrap_or("").to_string(),
            },
            "keypress" => {
                let key = match v.get("keys").and_then(|x| x.as_array()) {
                    Some(keys) => keys
                        .iter()
                        .filter_map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join("+"),
                    None => v.get("key").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                };
                ComputerAction::Keypress { key }
            }
            "wait" => ComputerAction::WaitMs {
                ms: v.get("ms").and_then(|x| x.as_i64()).unwrap_or(1000),
            },
            other => ComputerAction::Unknown(other.to_string()),
        }
    }
}

/// Browser operations offered to general models as function tools.
pub fn browser_functions() -> Value {
    let function = |name: &str, description: &str, parameters: Value| {
        json!({
            "type": "function",
            "name": name,
            "description": description,
            "parameters": parameters
        })
    };
    let no_params = json!({ "type": "object", "properties": {}, "required": [] });
    json!([
        function("navigate", "Open a URL in the current tab.", json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })),
        function("click", "Click the interactive element with the given index.", json!({
            "type": "object",
            "properties": { "index": { "type": "integer" } },
            "required": ["index"]
        })),
        function("type_text", "Replace the content of the input element with the given index. Set submit to press Enter afterwards.", json!({
            "type": "object",
            "properties": {
                "index": { "type": "integer" },
                "text": { "type": "string" },
                "submit": { "type": "boolean" }
            },
            "required": ["index", "text"]
        })),
        function("press_key", "Press a key or combination such as Enter or ctrl+l.", json!({
            "type": "object",
            "properties": { "key": { "type": "string" } },
            "required": ["key"]
        })),
        function("scroll", "Scroll the page up or down by a number of pixels.", json!({
            "type": "object",
            "properties": {
                "direction": { "type": "string", "enum": ["up", "down"] },
                "amount": { "type": "integer" }
            },
            "required": ["direction"]
        })),
        function("go_back", "Go back to the previous page.", no_params),
        function("wait", "Wait for the page to settle.", json!({
            "type": "object",
            "properties": { "seconds": { "type": "integer" } },
            "required": []
        })),
        function("done", "Finish the task and report the final answer.", json!({
            "type": "object",
            "properties": { "answer": { "type": "string" } },
            "required": ["answer"]
        })),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(model: &str) -> LlmClient {
        LlmClient::new(LlmConfig::new("http://localhost:1/v1", "sk-test", model)).unwrap()
    }

    #[test]
    fn missing_key_is_rejected() {
        let err = LlmClient::new(LlmConfig::new(DEFAULT_API_BASE, "", "gpt-4o")).err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn general_models_get_function_tools() {
        let req = client("gpt-4o").turn_request(
            TurnInput { instructions: "Goal: x".into(), observation: "url: about:blank".into() },
            None,
        );
        assert_eq!(req["model"], "gpt-4o");
        let names: Vec<&str> = req["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"click"));
        assert!(names.contains(&"done"));
        assert!(req.get("previous_response_id").is_none());
        assert_eq!(req["parallel_tool_calls"], false);
        assert_eq!(req["input"][0]["content"][1]["text"], "url: about:blank");
    }

    #[test]
    fn computer_use_models_get_hosted_tool() {
        let req = client("computer-use-preview")
            .turn_request(TurnInput::default(), Some(&ResponseId("resp_1".into())));
        assert_eq!(req["tools"][0]["type"], "computer_use_preview");
        assert_eq!(req["tools"][0]["display_width"], 1280);
        assert_eq!(req["previous_response_id"], "resp_1");
    }

    #[test]
    fn tool_outputs_are_shaped_per_call_kind() {
        let c = client("gpt-4o");
        let text = c.tool_output_request("call_1", ToolOutput::Text("ok".into()), None);
        assert_eq!(text["input"][0]["type"], "function_call_output");
        assert_eq!(text["input"][0]["output"], "ok");
        assert_eq!(text["parallel_tool_calls"], false);

        let shot = c.tool_output_request(
            "call_2",
            ToolOutput::Screenshot { data_base64: "AAAA".into(), safety_checks: vec![json!({"id": "sc"})] },
            Some(&ResponseId("resp_9".into())),
        );
        assert_eq!(shot["input"][0]["type"], "computer_call_output");
        assert_eq!(shot["input"][0]["output"]["image_url"], "data:image/png;base64,AAAA");
        assert_eq!(shot["input"][0]["acknowledged_safety_checks"][0]["id"], "sc");
        assert_eq!(shot["previous_response_id"], "resp_9");
    }

    #[test]
    fn function_call_wins_over_message() {
        let v = json!({
            "id": "resp_1",
            "output": [
                { "type": "message", "content": [{ "type": "output_text", "text": "thinking" }] },
                { "type": "function_call", "call_id": "call_7", "name": "click", "arguments": "{\"index\": 4}" }
            ]
        });
        match LlmClient::parse_output(v).unwrap() {
            LlmOutput::FunctionCall { call_id, name, arguments, response_id } => {
                assert_eq!(call_id, "call_7");
                assert_eq!(name, "click");
                assert_eq!(arguments.unwrap()["index"], 4);
                assert_eq!(response_id, ResponseId("resp_1".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_keep_the_call() {
        let v = json!({
            "id": "resp_4",
            "output": [{ "type": "function_call", "call_id": "call_8", "name": "click", "arguments": "{index: 2" }]
        });
        match LlmClient::parse_output(v).unwrap() {
            LlmOutput::FunctionCall { call_id, name, arguments, .. } => {
                assert_eq!(call_id, "call_8");
                assert_eq!(name, "click");
                assert!(arguments.unwrap_err().starts_with("invalid arguments for click"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_parts_are_joined() {
        let v = json!({
            "id": "resp_2",
            "output": [{ "type": "message", "content": [
                { "type": "output_text", "text": "Top " },
                { "type": "output_text", "text": "stories" }
            ]}]
        });
        match LlmClient::parse_output(v).unwrap() {
            LlmOutput::Message { text, .. } => assert_eq!(text, "Top stories"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn computer_call_decodes_action_and_safety_checks() {
        let v = json!({
            "id": "resp_3",
            "output": [{
                "type": "computer_call",
                "call_id": "call_c",
                "action": { "type": "keypress", "keys": ["CTRL", "L"] },
                "pending_safety_checks": [{ "id": "sc_1" }]
            }]
        });
        match LlmClient::parse_output(v).unwrap() {
            LlmOutput::ComputerCall { call_id, action, safety_checks, .. } => {
                assert_eq!(call_id, "call_c");
                assert_eq!(action, ComputerAction::Keypress { key: "CTRL+L".into() });
                assert_eq!(safety_checks.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_output_is_done_and_missing_id_fails() {
        assert!(matches!(
            LlmClient::parse_output(json!({ "id": "r", "output": [] })).unwrap(),
            LlmOutput::Done { .. }
        ));
        assert!(LlmClient::parse_output(json!({ "output": [] })).is_err());
    }

    #[test]
    fn scroll_reads_scroll_offsets() {
        let a = LlmClient::decode_action(&json!({ "type": "scroll", "x": 10, "y": 20, "scroll_x": 0, "scroll_y": 400 }));
        assert_eq!(a, ComputerAction::Scroll { dx: 0, dy: 400 });
        assert_eq!(
            LlmClient::decode_action(&json!({ "type": "drag" })),
            ComputerAction::Unknown("drag".into())
        );
    }
}
