//! Scripted MCP server used by the integration tests.
//!
//! Usage: `mock-tool-server <profile>` where profile is one of
//! `fs`, `calc`, `slow`, `crash`, `bad-handshake`, `garbage`, `stubborn`.
//! `stubborn` keeps running after stdin closes, so only a kill stops it.
//! Tool calls are answered on their own thread so slow calls never block
//! faster ones and responses can arrive out of order.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

type Stdout = Arc<Mutex<std::io::Stdout>>;

fn send(out: &Stdout, message: &Value) {
    if let Ok(mut out) = out.lock() {
        let _ = writeln!(out, "{message}");
        let _ = out.flush();
    }
}

fn reply(out: &Stdout, id: &Value, result: Value) {
    send(out, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn reply_error(out: &Stdout, id: &Value, code: i64, message: &str) {
    send(
        out,
        &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    );
}

fn text(value: impl std::fmt::Display) -> Value {
    json!({"content": [{"type": "text", "text": value.to_string()}], "isError": false})
}

fn tools_for(profile: &str) -> Vec<Value> {
    let path_schema = json!({
        "type": "object",
        "properties": {"path": {"type": "string"}},
        "required": ["path"]
    });
    match profile {
        "fs" => vec![
            json!({"name": "list_directory", "description": "List a directory", "inputSchema": path_schema}),
            json!({"name": "echo_env", "description": "Read an environment variable",
                   "inputSchema": {"type": "object", "properties": {"name": {"type": "string"}}}}),
        ],
        "calc" | "stubborn" => vec![json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        })],
        "slow" | "garbage" => vec![
            json!({"name": "sleep", "description": "Sleep then answer",
                   "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}}}),
            json!({"name": "exit", "description": "Terminate the server", "inputSchema": {"type": "object"}}),
        ],
        _ => Vec::new(),
    }
}

fn call_tool(profile: &str, out: &Stdout, id: &Value, params: &Value) {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];

    match (profile, name) {
        ("fs", "list_directory") => match args["path"].as_str() {
            Some(path) => reply(out, id, text(format!("fs listing of {path}: a.txt b.txt"))),
            None => reply_error(out, id, -32602, "path is required"),
        },
        ("fs", "echo_env") => {
            let var = args["name"].as_str().unwrap_or_default();
            reply(out, id, text(std::env::var(var).unwrap_or_default()));
        }
        ("calc" | "stubborn", "add") => match (args["a"].as_f64(), args["b"].as_f64()) {
            (Some(a), Some(b)) => reply(out, id, text(a + b)),
            _ => reply_error(out, id, -32602, "a and b are required numbers"),
        },
        ("slow", "sleep") => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            reply(out, id, text(format!("slept {ms}")));
        }
        ("garbage", "sleep") => {
            if let Ok(mut out) = out.lock() {
                let _ = writeln!(out, "this is not json");
                let _ = out.flush();
            }
        }
        (_, "exit") => std::process::exit(0),
        _ => reply_error(out, id, -32601, &format!("unknown tool: {name}")),
    }
}

fn main() {
    let profile = std::env::args().nth(1).unwrap_or_else(|| "fs".into());
    eprintln!("mock-tool-server starting with profile {profile}");

    if profile == "crash" {
        eprintln!("fatal: missing credentials");
        std::process::exit(3);
    }

    let out: Stdout = Arc::new(Mutex::new(std::io::stdout()));
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable input: {line}");
            continue;
        };

        // Notifications carry no id and need no reply.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" if profile == "bad-handshake" => {
                reply_error(&out, &id, -32603, "unsupported protocol version");
            }
            "initialize" => reply(
                &out,
                &id,
                json!({
                    "protocolVersion": params["protocolVersion"],
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": format!("mock-{profile}"), "version": "0.1.0"}
                }),
            ),
            "tools/list" => reply(&out, &id, json!({"tools": tools_for(&profile)})),
            "tools/call" => {
                let out = out.clone();
                let profile = profile.clone();
                std::thread::spawn(move || call_tool(&profile, &out, &id, &params));
            }
            "ping" => reply(&out, &id, json!({})),
            other => reply_error(&out, &id, -32601, &format!("method not found: {other}")),
        }
    }

    if profile == "stubborn" {
        eprintln!("stdin closed, ignoring");
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }

    eprintln!("stdin closed, exiting");
}
