//! Shared harness for router integration tests.
//!
//! Builds a router over in-memory duplex pipes: one scripted peer plays the
//! client, the rest play servers. Tests run with the tokio clock paused, so
//! deadline-driven scenarios execute instantly and deterministically.

use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use rass::endpoint::{Endpoint, Source};
use rass::error::ProxyError;
use rass::jsonrpc::{Message, Reply, RequestId};
use rass::policy::{PolicyConfig, create_policy};
use rass::router::{self, Router, RouterOptions};
use rass::transport::{MessageReader, MessageWriter};

/// One scripted side of a proxy stream (the client or one server).
pub struct Peer {
    reader: MessageReader<ReadHalf<DuplexStream>>,
    writer: MessageWriter<WriteHalf<DuplexStream>>,
}

impl Peer {
    fn new(stream: DuplexStream) -> Peer {
        let (read, write) = split(stream);
        Peer {
            reader: MessageReader::new(read),
            writer: MessageWriter::new(write),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        self.writer.write_message(&msg.to_value()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        let value = self
            .reader
            .read_message()
            .await
            .unwrap()
            .expect("peer stream closed");
        Message::classify(value).unwrap()
    }

    /// Receive with a timeout; `None` means nothing arrived in the window.
    pub async fn recv_timeout(&mut self, ms: u64) -> Option<Message> {
        match tokio::time::timeout(Duration::from_millis(ms), self.recv()).await {
            Ok(msg) => Some(msg),
            Err(_) => None,
        }
    }

    /// Read until a request with the given method arrives, skipping
    /// broadcast notifications along the way.
    pub async fn expect_request(&mut self, method: &str) -> (RequestId, Option<Value>) {
        loop {
            match self.recv().await {
                Message::Request {
                    id,
                    method: m,
                    params,
                } if m == method => return (id, params),
                Message::Notification { .. } => continue,
                other => panic!("expected {method} request, got {other:?}"),
            }
        }
    }

    /// Read until a notification with the given method arrives.
    pub async fn expect_notification(&mut self, method: &str) -> Option<Value> {
        loop {
            match self.recv().await {
                Message::Notification { method: m, params } if m == method => return params,
                Message::Notification { .. } => continue,
                other => panic!("expected {method} notification, got {other:?}"),
            }
        }
    }

    pub async fn respond(&mut self, id: RequestId, result: Value) {
        self.send(Message::response(id, Reply::ok(result))).await;
    }

    pub async fn respond_error(&mut self, id: RequestId, code: i64, message: &str) {
        self.send(Message::error_response(id, code, message)).await;
    }
}

/// A router wired to scripted peers.
pub struct Harness {
    pub client: Peer,
    pub servers: Vec<Peer>,
    pub proxy: JoinHandle<Result<i32, ProxyError>>,
}

impl Harness {
    /// Start a router with the default LSP policy over `count` servers.
    pub fn lsp(count: usize) -> Harness {
        Harness::start(count, false)
    }

    pub fn start(count: usize, drop_tardy: bool) -> Harness {
        let (events_tx, events_rx) = router::channel();

        let (client_side, proxy_side) = duplex(1 << 16);
        let (proxy_read, proxy_write) = split(proxy_side);
        let client_endpoint = Endpoint::start(
            Source::Client,
            "client",
            proxy_read,
            proxy_write,
            events_tx.clone(),
            None,
        );

        let mut servers = Vec::with_capacity(count);
        let mut endpoints = Vec::with_capacity(count);
        for index in 0..count {
            let (server_side, proxy_side) = duplex(1 << 16);
            let (proxy_read, proxy_write) = split(proxy_side);
            endpoints.push(Endpoint::start(
                Source::Server(index),
                format!("s{index}"),
                proxy_read,
                proxy_write,
                events_tx.clone(),
                None,
            ));
            servers.push(Peer::new(server_side));
        }

        let names = (0..count).map(|i| format!("s{i}")).collect();
        let policy_config = PolicyConfig {
            drop_tardy,
            ..PolicyConfig::default()
        };
        let policy = create_policy("lsp", names, policy_config).unwrap();

        let router_opts = RouterOptions {
            drop_tardy,
            ..RouterOptions::default()
        };
        let router = Router::new(
            client_endpoint,
            endpoints,
            policy,
            router_opts,
            events_tx,
            events_rx,
        );

        Harness {
            client: Peer::new(client_side),
            servers,
            proxy: tokio::spawn(router.run()),
        }
    }

    /// Run the `initialize` handshake: every server answers with its
    /// capability table and a `serverInfo.name`, and the merged response
    /// comes back. Panics if the names/caps lists mismatch the server count.
    pub async fn initialize(&mut self, caps: &[Value], names: &[&str]) -> Value {
        self.client
            .send(Message::request(
                RequestId::Number(1),
                "initialize",
                Some(json!({"capabilities": {}})),
            ))
            .await;

        for (index, server) in self.servers.iter_mut().enumerate() {
            let (id, _) = server.expect_request("initialize").await;
            server
                .respond(id, init_result(&caps[index], names[index]))
                .await;
        }

        match self.client.recv().await {
            Message::Response { id, reply } => {
                assert_eq!(id, RequestId::Number(1));
                assert!(!reply.is_error(), "initialize failed: {:?}", reply.error);
                reply.result.unwrap()
            }
            other => panic!("expected initialize response, got {other:?}"),
        }
    }
}

/// An `initialize` result payload.
pub fn init_result(caps: &Value, name: &str) -> Value {
    json!({
        "capabilities": caps,
        "serverInfo": {"name": name, "version": "0.1"},
    })
}
