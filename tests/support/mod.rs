#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use redis_pool::{encode_value, Value, ValueCodec};

/// An in-process server speaking just enough RESP to exercise the pool:
/// scripted replies per command, per-connection subscription counting, and
/// a few counters the tests assert on.
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    _accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct ServerState {
    /// Connections accepted over the server's lifetime.
    accepted: AtomicUsize,
    /// Connections currently open.
    active: AtomicUsize,
    /// Every command name the server has seen, in arrival order.
    commands: Mutex<Vec<Vec<u8>>>,
    /// Per-connection handler tasks, so tests can sever connections.
    client_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                accept_state.active.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let task = tokio::spawn(async move {
                    handle_client(socket, &conn_state).await;
                    conn_state.active.fetch_sub(1, Ordering::SeqCst);
                });
                accept_state.client_tasks.lock().unwrap().push(task);
            }
        });
        MockServer {
            addr,
            state,
            _accept_task: accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn seen_commands(&self) -> Vec<Vec<u8>> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Severs every open connection, as if the server had crashed.
    /// Connection counters are not maintained past this point.
    pub fn sever_connections(&self) {
        for task in self.state.client_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self._accept_task.abort();
    }
}

fn command_args(value: &Value) -> Option<Vec<Vec<u8>>> {
    let items = value.as_sequence()?;
    let mut args = Vec::with_capacity(items.len());
    for item in items {
        args.push(item.as_bytes()?.to_vec());
    }
    if args.is_empty() {
        return None;
    }
    Some(args)
}

fn confirmation(kind: &str, name: &[u8], count: i64) -> Value {
    Value::Array(Some(vec![
        Value::bulk(kind),
        Value::bulk(name),
        Value::Int(count),
    ]))
}

fn message(channel: &[u8], payload: &[u8]) -> Value {
    Value::Array(Some(vec![
        Value::bulk("message"),
        Value::bulk(channel),
        Value::bulk(payload),
    ]))
}

async fn handle_client(socket: TcpStream, state: &ServerState) {
    let mut framed = ValueCodec::default().framed(socket);
    let mut subscriptions: i64 = 0;
    while let Some(Ok(request)) = framed.next().await {
        let Some(args) = command_args(&request) else {
            break;
        };
        state.commands.lock().unwrap().push(args[0].clone());
        let name = args[0].to_ascii_uppercase();
        let replies: Vec<Value> = match name.as_slice() {
            b"PING" => vec![Value::SimpleString("PONG".to_string())],
            b"ECHO" => vec![Value::BulkString(Some(args[1].clone()))],
            b"AUTH" | b"SELECT" => vec![Value::okay()],
            b"GET" => vec![Value::nil_bulk()],
            b"SUBSCRIBE" | b"PSUBSCRIBE" => {
                subscriptions += 1;
                let kind = if name == b"SUBSCRIBE" {
                    "subscribe"
                } else {
                    "psubscribe"
                };
                // confirm, then immediately publish one message so tests can
                // observe delivery without a second client
                vec![
                    confirmation(kind, &args[1], subscriptions),
                    message(&args[1], b"hello"),
                ]
            }
            b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => {
                subscriptions = (subscriptions - 1).max(0);
                let kind = if name == b"UNSUBSCRIBE" {
                    "unsubscribe"
                } else {
                    "punsubscribe"
                };
                vec![confirmation(kind, &args[1], subscriptions)]
            }
            _ => vec![Value::Error("ERR unknown command".to_string())],
        };
        for reply in replies {
            let mut out = Vec::new();
            encode_value(&reply, &mut out).unwrap();
            if framed.send(out).await.is_err() {
                return;
            }
        }
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
