//! Loopback chat-completions stub for agent and run tests.

use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Serves the given `(status, body)` responses in order, one connection each, and records the
/// JSON request bodies it received.
pub(crate) struct StubServer {
    pub(crate) base_url: String,
    handle: JoinHandle<Vec<Value>>,
}

impl StubServer {
    /// `None` when the sandbox disallows loopback binds; callers skip the test.
    pub(crate) fn start(responses: Vec<(u16, String)>) -> Option<Self> {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(err) => {
                eprintln!("skipping: loopback bind failed: {}", err);
                return None;
            }
        };
        let addr = listener.local_addr().expect("local_addr");
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                requests.push(read_request(&mut stream));
                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).expect("write");
                let _ = stream.flush();
            }
            requests
        });
        Some(Self {
            base_url: format!("http://{}", addr),
            handle,
        })
    }

    pub(crate) fn requests(self) -> Vec<Value> {
        self.handle.join().expect("server join")
    }
}

fn read_request(stream: &mut TcpStream) -> Value {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let mut expected: Option<usize> = None;
    loop {
        if let Some(total) = expected {
            if buf.len() >= total {
                break;
            }
        }
        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if expected.is_none() {
                    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                        let length = head
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        expected = Some(end + 4 + length);
                    }
                }
            }
            Err(_) => break,
        }
    }
    let body_start = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|end| end + 4)
        .unwrap_or(buf.len());
    serde_json::from_slice(&buf[body_start..]).unwrap_or(Value::Null)
}

pub(crate) fn text_completion(content: &str) -> (u16, String) {
    let body = json!({
        "choices": [{"message": {"role": "assistant", "content": content, "tool_calls": null}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
    });
    (200, body.to_string())
}

/// A completion requesting `(id, name, arguments)` tool calls.
pub(crate) fn tool_call_completion(calls: &[(&str, &str, &str)]) -> (u16, String) {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, arguments)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })
        })
        .collect();
    let body = json!({
        "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": calls}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
    });
    (200, body.to_string())
}

pub(crate) fn error_response(status: u16, message: &str) -> (u16, String) {
    (status, json!({"error": {"message": message}}).to_string())
}
