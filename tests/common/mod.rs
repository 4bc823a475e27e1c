//! Shared fixtures: an in-process MCP backend speaking newline-delimited
//! JSON-RPC over TCP, with a switchable failure mode.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Answer every request
    Ok = 0,
    /// Close the connection instead of answering
    Hangup = 1,
    /// Answer with a JSON-RPC error object
    Reject = 2,
    /// Answer after two seconds
    Slow = 3,
}

impl Mode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Mode::Hangup,
            2 => Mode::Reject,
            3 => Mode::Slow,
            _ => Mode::Ok,
        }
    }
}

pub struct MockBackend {
    pub name: String,
    pub addr: SocketAddr,
    mode: Arc<AtomicU8>,
    calls: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mode = Arc::new(AtomicU8::new(Mode::Ok as u8));
        let calls = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let backend = Self {
            name: name.to_string(),
            addr,
            mode: mode.clone(),
            calls: calls.clone(),
            pings: pings.clone(),
        };
        let name = name.to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (mode, calls, pings, name) =
                    (mode.clone(), calls.clone(), pings.clone(), name.clone());
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(req) = serde_json::from_str::<Value>(&line) else {
                            return;
                        };
                        let id = req["id"].clone();
                        let method = req["method"].as_str().unwrap_or_default().to_string();
                        let mode = Mode::from_u8(mode.load(Ordering::SeqCst));

                        if method == "ping" {
                            pings.fetch_add(1, Ordering::SeqCst);
                            if mode == Mode::Hangup {
                                return;
                            }
                            let out = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                            if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                                return;
                            }
                            continue;
                        }

                        calls.fetch_add(1, Ordering::SeqCst);
                        let out = match mode {
                            Mode::Hangup => return,
                            Mode::Reject => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": -32602, "message": "rejected", "data": {"server": name}}
                            }),
                            Mode::Slow => {
                                tokio::time::sleep(Duration::from_secs(2)).await;
                                json!({"jsonrpc": "2.0", "id": id, "result": {"server": name}})
                            }
                            Mode::Ok => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": {"server": name, "method": method, "params": req["params"]}
                            }),
                        };
                        if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        backend
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Non-ping requests received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}
