//! Tool catalog offered to the model and translation back to commands

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::protocol::messages::ParamKind;
use crate::protocol::{ActionType, Parameters};

/// Name of the tool that ends a session
pub const FINISH_TOOL: &str = "finish_task";

/// JSON-schema function tool, shared by both backend wire formats
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Actions the model may call directly
const MODEL_ACTIONS: [ActionType; 13] = [
    ActionType::Click,
    ActionType::Hover,
    ActionType::Drag,
    ActionType::TypeText,
    ActionType::KeyPress,
    ActionType::Scroll,
    ActionType::Wait,
    ActionType::RunCommand,
    ActionType::BrowserNavigate,
    ActionType::BrowserClick,
    ActionType::BrowserType,
    ActionType::LaunchApp,
    ActionType::CheckAppInstalled,
];

fn integer(description: &str) -> Value {
    json!({"type": "integer", "description": description})
}

fn string(description: &str) -> Value {
    json!({"type": "string", "description": description})
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

fn describe(action: ActionType) -> (&'static str, Value) {
    match action {
        ActionType::Click => (
            "Click at screen coordinates taken from the current screenshot.",
            object(
                json!({
                    "x": integer("Horizontal pixel position"),
                    "y": integer("Vertical pixel position"),
                    "button": {"type": "string", "enum": ["left", "right", "middle"]}
                }),
                &["x", "y"],
            ),
        ),
        ActionType::Hover => (
            "Move the mouse to screen coordinates without clicking.",
            object(
                json!({"x": integer("Horizontal pixel position"), "y": integer("Vertical pixel position")}),
                &["x", "y"],
            ),
        ),
        ActionType::Drag => (
            "Press the mouse at a start point and release it at an end point.",
            object(
                json!({
                    "start_x": integer("Start x"),
                    "start_y": integer("Start y"),
                    "end_x": integer("End x"),
                    "end_y": integer("End y")
                }),
                &["start_x", "start_y", "end_x", "end_y"],
            ),
        ),
        ActionType::TypeText => (
            "Type text into the focused input.",
            object(json!({"text": string("Text to type")}), &["text"]),
        ),
        ActionType::KeyPress => (
            "Press a key or key combination, e.g. \"Return\" or \"ctrl+l\".",
            object(json!({"keys": string("Key combination")}), &["keys"]),
        ),
        ActionType::Scroll => (
            "Scroll the view.",
            object(
                json!({
                    "direction": {"type": "string", "enum": ["up", "down", "left", "right"]},
                    "amount": integer("Number of scroll steps (default 3)")
                }),
                &["direction"],
            ),
        ),
        ActionType::Wait => (
            "Pause before the next observation, e.g. while a page loads.",
            object(json!({"seconds": {"type": "number", "description": "Seconds to wait"}}), &["seconds"]),
        ),
        ActionType::RunCommand => (
            "Run a shell command on the machine and return its output and exit code.",
            object(json!({"command": string("Shell command line")}), &["command"]),
        ),
        ActionType::BrowserNavigate => (
            "Open a URL in the browser.",
            object(json!({"url": string("Absolute URL")}), &["url"]),
        ),
        ActionType::BrowserClick => (
            "Click a page element by its index from the element list.",
            object(json!({"element_index": integer("Element index")}), &["element_index"]),
        ),
        ActionType::BrowserType => (
            "Type text into a page element by its index from the element list.",
            object(
                json!({"element_index": integer("Element index"), "text": string("Text to type")}),
                &["element_index", "text"],
            ),
        ),
        ActionType::LaunchApp => (
            "Launch a desktop application by name.",
            object(json!({"app_name": string("Application name")}), &["app_name"]),
        ),
        ActionType::CheckAppInstalled => (
            "Check whether an application is installed.",
            object(json!({"app_name": string("Application name")}), &["app_name"]),
        ),
        _ => ("", object(json!({}), &[])),
    }
}

/// Every tool the model is offered, ending with the completion tool
pub fn catalog() -> Vec<ToolSpec> {
    let mut tools: Vec<ToolSpec> = MODEL_ACTIONS
        .iter()
        .map(|&action| {
            let (description, parameters) = describe(action);
            ToolSpec {
                name: action.as_str(),
                description,
                parameters,
            }
        })
        .collect();

    tools.push(ToolSpec {
        name: FINISH_TOOL,
        description: "Call when the task is done or cannot be completed. Report whether it succeeded and why.",
        parameters: object(
            json!({
                "success": {"type": "boolean", "description": "Whether the task was accomplished"},
                "reason": string("Short explanation")
            }),
            &["success", "reason"],
        ),
    });
    tools
}

/// Turn a model tool call into a validated command
///
/// Numeric arguments sent as strings are coerced, since smaller models do
/// that often. The error text is fed back to the model.
pub fn to_command(name: &str, arguments: &Value) -> Result<(ActionType, Parameters), String> {
    let action = MODEL_ACTIONS
        .iter()
        .copied()
        .find(|action| action.as_str() == name)
        .ok_or_else(|| format!("unknown tool '{}'", name))?;

    let mut provided: Map<String, Value> = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => return Err(format!("arguments for '{}' must be a JSON object", name)),
        },
        _ => return Err(format!("arguments for '{}' must be a JSON object", name)),
    };

    // Required parameters first, in declaration order
    let mut parameters = Parameters::new();
    for &(param, kind) in action.required_params() {
        if let Some(value) = provided.remove(param) {
            parameters.insert(param.to_string(), coerce(value, kind));
        }
    }
    for (key, value) in provided {
        parameters.insert(key, value);
    }

    action.validate(&parameters).map_err(|e| e.to_string())?;
    Ok((action, parameters))
}

fn coerce(value: Value, kind: ParamKind) -> Value {
    let parsed = match (&value, kind) {
        (Value::String(text), ParamKind::Integer) => text.trim().parse::<i64>().ok().map(Value::from),
        (Value::String(text), ParamKind::Number) => text.trim().parse::<f64>().ok().map(Value::from),
        _ => None,
    };
    parsed.unwrap_or(value)
}
