//! Prompt-token estimate for chat-completion requests.
//!
//! Mirrors how OpenAI frames messages and function definitions before
//! tokenizing, so the pre-dispatch estimate tracks the billed count.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::tokenizer::{Encoding, TokenCounter};

/// Tokens wrapping every message (`<|start|>{role}\n{content}<|end|>\n`).
const TOKENS_PER_MESSAGE: i64 = 3;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING: i64 = 3;
const FUNCTION_DEFINITION_OVERHEAD: i64 = 9;
const SYSTEM_WITH_FUNCTIONS_DISCOUNT: i64 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: Option<FunctionDef>,
}

impl ChatMessage {
    /// Text content. Array content contributes its `text` parts.
    pub fn text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

impl ChatCompletionRequest {
    /// Function definitions, including those declared as tools.
    pub fn all_functions(&self) -> Vec<&FunctionDef> {
        self.functions
            .iter()
            .chain(
                self.tools
                    .iter()
                    .filter(|t| t.kind.is_empty() || t.kind == "function")
                    .filter_map(|t| t.function.as_ref()),
            )
            .collect()
    }
}

pub fn prompt_tokens(req: &ChatCompletionRequest, counter: &TokenCounter) -> i64 {
    let encoding = Encoding::for_model(&req.model);
    let count = |text: &str| counter.count(encoding, text);
    let functions = req.all_functions();

    let mut tokens = 0;
    let mut padded_system = false;
    for msg in &req.messages {
        let mut content = msg.text();
        if msg.role == "system" && !padded_system {
            content.push('\n');
            padded_system = true;
        }
        tokens += message_tokens(&count, msg, &content);
    }
    tokens += REPLY_PRIMING;

    if !functions.is_empty() {
        tokens += count(&format_function_definitions(&functions));
        tokens += FUNCTION_DEFINITION_OVERHEAD;
        if req.messages.iter().any(|m| m.role == "system") {
            tokens -= SYSTEM_WITH_FUNCTIONS_DISCOUNT;
        }
    }
    tokens
}

fn message_tokens(count: &dyn Fn(&str) -> i64, msg: &ChatMessage, content: &str) -> i64 {
    let mut tokens = TOKENS_PER_MESSAGE + count(&msg.role) + count(content);
    if let Some(name) = &msg.name {
        tokens += count(name) + 1;
    }
    if let Some(call) = &msg.function_call {
        tokens += count(&call.name) + count(&call.arguments) + 3;
    }
    if msg.role == "function" {
        tokens -= 2;
    }
    tokens
}

// MARK: - Function namespace

/// Render function definitions as the TypeScript-like namespace the model
/// sees.
pub fn format_function_definitions(functions: &[&FunctionDef]) -> String {
    let mut lines = vec!["namespace functions {".to_string(), String::new()];
    for f in functions {
        if let Some(desc) = f.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("// {desc}"));
        }
        let properties = f
            .parameters
            .as_ref()
            .and_then(|p| p.get("properties"))
            .and_then(Value::as_object)
            .filter(|p| !p.is_empty());
        match (properties, &f.parameters) {
            (Some(_), Some(params)) => {
                lines.push(format!("type {} = (_: {{", f.name));
                lines.push(format_object_properties(params, 0));
                lines.push("}) => any;".to_string());
            }
            _ => lines.push(format!("type {} = () => any;", f.name)),
        }
        lines.push(String::new());
    }
    lines.push("} // namespace functions".to_string());
    lines.join("\n")
}

fn format_object_properties(obj: &Value, indent: usize) -> String {
    let empty = Map::new();
    let properties = obj
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required: Vec<&str> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let pad = " ".repeat(indent);
    let mut lines = Vec::new();
    for (name, param) in properties {
        if let Some(desc) = param.get("description").and_then(Value::as_str) {
            if indent < 2 {
                lines.push(format!("{pad}// {desc}"));
            }
        }
        let optional = if required.contains(&name.as_str()) { "" } else { "?" };
        lines.push(format!(
            "{pad}{name}{optional}: {},",
            format_type(param, indent)
        ));
    }
    lines.join("\n")
}

fn format_type(param: &Value, indent: usize) -> String {
    let enum_values = || {
        param.get("enum").and_then(Value::as_array).map(|values| {
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => format!("\"{s}\""),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" | ")
        })
    };
    match param.get("type").and_then(Value::as_str) {
        Some("string") => enum_values().unwrap_or_else(|| "string".to_string()),
        Some("number") | Some("integer") => enum_values().unwrap_or_else(|| "number".to_string()),
        Some("boolean") => "boolean".to_string(),
        Some("null") => "null".to_string(),
        Some("object") => format!("{{\n{}\n}}", format_object_properties(param, indent + 2)),
        Some("array") => match param.get("items") {
            Some(items) => format!("{}[]", format_type(items, indent)),
            None => "any[]".to_string(),
        },
        _ => "any".to_string(),
    }
}

// MARK: - Tests
