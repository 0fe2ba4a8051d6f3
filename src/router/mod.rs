//! The multiplexer core.
//!
//! The router is a single logical actor: it owns every endpoint, the pending
//! tables and the policy, and touches them only from its own task. Reader
//! tasks, deadline timers and the supervisor communicate with it exclusively
//! by enqueuing [`Event`]s; there is no shared mutation anywhere.
//!
//! Client requests are routed per the policy's decision, fan-outs are
//! collected under a deadline, server-originated requests get their ids
//! rewritten both ways, and diagnostics flushes are coalesced. Every client
//! request produces exactly one response, whether servers answered, timed
//! out, died, or were cancelled.

mod pending;

pub use pending::{CompletionMode, PendingState};

use std::collections::HashSet;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::endpoint::{Endpoint, Source, StreamEvent};
use crate::error::ProxyError;
use crate::jsonrpc::{
    METHOD_NOT_FOUND, Message, REQUEST_CANCELLED, REQUEST_FAILED, Reply, RequestId,
};
use crate::policy::{NotifAction, Policy, RouteAction};
use pending::PendingTables;

/// Depth of the router's event queue.
const EVENT_QUEUE: usize = 1024;

/// Everything the router's event loop selects over.
#[derive(Debug)]
pub enum Event {
    /// Something arrived on (or happened to) an endpoint's read side.
    Stream(Source, StreamEvent),
    /// The deadline of a pending client request elapsed.
    Deadline(u64),
    /// The coalescing window for a URI's diagnostics elapsed.
    FlushDiagnostics(String),
    /// The supervisor reaped a server subprocess.
    ServerExited(usize),
    /// Grace period after broadcasting `exit` elapsed.
    ExitTimeout,
}

/// Router knobs filled from the CLI.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Diagnostics coalescing window.
    pub coalesce_window: Duration,
    /// Mark servers tardy at the deadline and drop their late output.
    pub drop_tardy: bool,
    /// How long to wait for servers to wind down after `exit`.
    pub exit_grace: Duration,
}

impl Default for RouterOptions {
    fn default() -> RouterOptions {
        RouterOptions {
            coalesce_window: Duration::from_millis(50),
            drop_tardy: false,
            exit_grace: Duration::from_millis(2000),
        }
    }
}

/// Create the event channel shared by the router and its producers.
pub fn channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(EVENT_QUEUE)
}

/// The multiplexer actor. Owns all mutable session state.
pub struct Router {
    client: Endpoint,
    servers: Vec<Endpoint>,
    policy: Box<dyn Policy>,
    pending: PendingTables,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    opts: RouterOptions,
    /// Per-server: has answered `initialize`.
    initialized: Vec<bool>,
    /// Sequence number of the in-flight `initialize` fan-out.
    init_seq: Option<u64>,
    /// URIs with a diagnostics flush timer running.
    scheduled_flushes: HashSet<String>,
    /// The client has issued `shutdown`.
    shutting_down: bool,
    /// The client has issued `exit`.
    exiting: bool,
    /// The client's streams are gone.
    client_gone: bool,
}

impl Router {
    pub fn new(
        client: Endpoint,
        servers: Vec<Endpoint>,
        policy: Box<dyn Policy>,
        opts: RouterOptions,
        events_tx: mpsc::Sender<Event>,
        events_rx: mpsc::Receiver<Event>,
    ) -> Router {
        let count = servers.len();
        Router {
            client,
            servers,
            policy,
            pending: PendingTables::default(),
            events_tx,
            events_rx,
            opts,
            initialized: vec![false; count],
            init_seq: None,
            scheduled_flushes: HashSet::new(),
            shutting_down: false,
            exiting: false,
            client_gone: false,
        }
    }

    /// Run the event loop to completion and wind the session down.
    ///
    /// Returns the process exit code for orderly endings. Fatal conditions
    /// (framing errors, initialization failures, unexpected server death)
    /// come back as errors after a best-effort teardown.
    pub async fn run(mut self) -> Result<i32, ProxyError> {
        let outcome = self.event_loop().await;
        self.teardown().await;
        outcome
    }

    async fn event_loop(&mut self) -> Result<i32, ProxyError> {
        loop {
            let Some(event) = self.events_rx.recv().await else {
                return Ok(1);
            };
            match event {
                Event::Stream(Source::Client, StreamEvent::Message(msg)) => {
                    if let Some(code) = self.on_client_message(msg).await {
                        return Ok(code);
                    }
                }
                Event::Stream(Source::Client, StreamEvent::Eof) => {
                    self.client_gone = true;
                    if self.shutting_down || self.exiting {
                        return Ok(0);
                    }
                    tracing::error!("client went away without shutdown");
                    return Ok(1);
                }
                Event::Stream(Source::Client, StreamEvent::Fatal(e)) => {
                    return Err(ProxyError::Framing {
                        endpoint: Source::Client,
                        source: e,
                    });
                }
                Event::Stream(Source::Server(idx), StreamEvent::Message(msg)) => {
                    self.on_server_message(idx, msg).await;
                }
                Event::Stream(Source::Server(idx), StreamEvent::Eof)
                | Event::ServerExited(idx) => {
                    if let Some(code) = self.on_server_gone(idx).await? {
                        return Ok(code);
                    }
                }
                Event::Stream(Source::Server(idx), StreamEvent::Fatal(e)) => {
                    return Err(ProxyError::Framing {
                        endpoint: Source::Server(idx),
                        source: e,
                    });
                }
                Event::Deadline(seq) => self.on_deadline(seq).await?,
                Event::FlushDiagnostics(uri) => self.flush_diagnostics(&uri).await,
                Event::ExitTimeout => {
                    if self.exiting {
                        tracing::warn!("servers still running after exit grace period");
                        return Ok(0);
                    }
                }
            }
        }
    }

    // ── Client → servers ─────────────────────────────────────────────────

    /// Handle one client message. Returns an exit code when the session is
    /// over.
    async fn on_client_message(&mut self, msg: Message) -> Option<i32> {
        match msg {
            Message::Request {
                id,
                method,
                mut params,
            } => {
                if method == "shutdown" {
                    self.shutting_down = true;
                }
                tracing::debug!(%id, method, "client request");
                self.route_client_request(id, method, &mut params).await;
                None
            }
            Message::Notification { method, params } => match method.as_str() {
                "$/cancelRequest" => {
                    self.on_client_cancel(params.as_ref()).await;
                    None
                }
                "exit" => {
                    tracing::info!("client sent exit, winding down");
                    self.exiting = true;
                    self.broadcast(Message::Notification { method, params }).await;
                    if self.servers.iter().all(|s| !s.is_alive()) {
                        return Some(0);
                    }
                    let tx = self.events_tx.clone();
                    let grace = self.opts.exit_grace;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = tx.send(Event::ExitTimeout).await;
                    });
                    None
                }
                _ => {
                    self.policy.observe_client_notification(&method, params.as_ref());
                    self.broadcast(Message::Notification { method, params }).await;
                    None
                }
            },
            Message::Response { id, reply } => {
                // The client answering a server-originated request: put the
                // original id back and hand it to the owning server.
                match self.pending.remove_server_request(&id) {
                    Some(origin) => {
                        self.dispatch(origin.server, Message::response(origin.original_id, reply))
                            .await;
                    }
                    None => {
                        tracing::warn!(%id, "client response with no matching request, dropped");
                    }
                }
                None
            }
        }
    }

    async fn route_client_request(
        &mut self,
        id: RequestId,
        method: String,
        params: &mut Option<Value>,
    ) {
        let alive: Vec<bool> = self.servers.iter().map(Endpoint::is_alive).collect();
        match self.policy.route_request(&method, params.as_mut(), &alive) {
            RouteAction::Single(idx) => {
                let seq = self.pending.insert(
                    id.clone(),
                    method.clone(),
                    CompletionMode::Verbatim,
                    &[idx],
                );
                self.schedule_deadline(seq, &method);
                tracing::debug!(method, server = %self.servers[idx].name(), "routed to one server");
                self.dispatch(
                    idx,
                    Message::Request {
                        id,
                        method,
                        params: params.take(),
                    },
                )
                .await;
            }
            RouteAction::FanOut(targets) => {
                let seq =
                    self.pending
                        .insert(id.clone(), method.clone(), CompletionMode::Merge, &targets);
                if method == "initialize" {
                    self.init_seq = Some(seq);
                }
                self.schedule_deadline(seq, &method);
                tracing::debug!(method, ?targets, "fanned out");
                for idx in targets {
                    self.dispatch(
                        idx,
                        Message::Request {
                            id: id.clone(),
                            method: method.clone(),
                            params: params.clone(),
                        },
                    )
                    .await;
                }
            }
            RouteAction::EmptyReply(value) => {
                self.send_to_client(Message::response(id, Reply::ok(value))).await;
            }
            RouteAction::MethodNotFound => {
                self.send_to_client(Message::error_response(
                    id,
                    METHOD_NOT_FOUND,
                    format!("no server provides {method}"),
                ))
                .await;
            }
            RouteAction::Drop => {
                tracing::debug!(method, "request handled by proxy, not forwarded");
            }
            RouteAction::Broadcast => {
                // Requests always need a collected response; a policy asking
                // for a fire-and-forget broadcast of one is buggy.
                tracing::warn!(method, "policy broadcast a request, dropping");
            }
        }
    }

    /// Translate a client cancel onto every server still outstanding.
    async fn on_client_cancel(&mut self, params: Option<&Value>) {
        let Some(id) = params
            .and_then(|p| p.get("id"))
            .and_then(RequestId::from_value)
        else {
            tracing::warn!("cancel without a usable id, dropped");
            return;
        };
        let Some(seq) = self.pending.seq_for_client_id(&id) else {
            tracing::debug!(%id, "cancel for unknown or completed request");
            return;
        };

        let entry = self.pending.get_mut(seq).expect("pending entry for seq");
        entry.state = PendingState::Cancelled;
        let outstanding: Vec<usize> = entry.outstanding.iter().copied().collect();
        tracing::debug!(%id, ?outstanding, "cancelling in-flight request");

        // Each addressed server saw the client's original id, so the cancel
        // params pass through unchanged.
        let params = json!({"id": id.to_value()});
        for idx in outstanding {
            self.dispatch(
                idx,
                Message::notification("$/cancelRequest", Some(params.clone())),
            )
            .await;
        }
    }

    // ── Servers → client ─────────────────────────────────────────────────

    async fn on_server_message(&mut self, idx: usize, msg: Message) {
        match msg {
            Message::Response { id, reply } => self.on_server_response(idx, id, reply).await,
            Message::Request { id, method, params } => {
                if self.shutting_down || self.exiting || self.client_gone {
                    // Don't bother a dying client; answer for it.
                    self.dispatch(
                        idx,
                        Message::error_response(id, REQUEST_CANCELLED, "proxy shutting down"),
                    )
                    .await;
                    return;
                }
                let proxy_id = self.pending.mint_proxy_id();
                tracing::debug!(
                    server = %self.servers[idx].name(),
                    original = %id,
                    minted = %proxy_id,
                    method,
                    "forwarding server request to client"
                );
                self.pending.insert_server_request(proxy_id.clone(), idx, id);
                self.send_to_client(Message::Request {
                    id: proxy_id,
                    method,
                    params,
                })
                .await;
            }
            Message::Notification { method, mut params } => {
                if method == "$/cancelRequest" {
                    self.on_server_cancel(idx, params.as_ref()).await;
                    return;
                }
                match self.policy.server_notification(idx, &method, params.as_mut()) {
                    NotifAction::Forward => {
                        self.send_to_client(Message::Notification { method, params }).await;
                    }
                    NotifAction::ScheduleDiagnostics(uri) => self.schedule_flush(uri),
                    NotifAction::Drop => {}
                }
            }
        }
    }

    async fn on_server_response(&mut self, idx: usize, id: RequestId, reply: Reply) {
        let Some(seq) = self.pending.seq_for_server_response(idx, &id) else {
            if self.pending.take_tardy(idx, &id) {
                tracing::warn!(server = %self.servers[idx].name(), %id, "tardy response discarded");
            } else {
                tracing::warn!(server = %self.servers[idx].name(), %id, "response with no matching request, dropped");
            }
            return;
        };

        // A cancelled request forwards whichever reply lands first (usually
        // the RequestCancelled error) and drops the rest.
        if self.pending.get(seq).map(|e| e.state) == Some(PendingState::Cancelled) {
            let entry = self.pending.remove(seq).expect("pending entry for seq");
            self.pending.mark_tardy(&entry);
            self.send_to_client(Message::response(entry.client_id, reply)).await;
            return;
        }

        let method = self
            .pending
            .get(seq)
            .map(|e| e.method.clone())
            .expect("pending entry for seq");
        if let Some(name) = self.policy.observe_server_reply(idx, &method, &reply) {
            tracing::info!(server = %self.servers[idx].name(), name, "server introduced itself");
            self.servers[idx].rename(name);
        }
        if method == "initialize" && !reply.is_error() {
            self.initialized[idx] = true;
        }

        if self.pending.record_reply(seq, idx, reply) {
            let entry = self.pending.remove(seq).expect("pending entry for seq");
            if self.init_seq == Some(seq) {
                self.init_seq = None;
            }
            self.finish(entry).await;
        }
    }

    /// A server cancelling a request it previously sent to the client.
    async fn on_server_cancel(&mut self, idx: usize, params: Option<&Value>) {
        let original = params
            .and_then(|p| p.get("id"))
            .and_then(RequestId::from_value);
        if let Some(original) = original {
            if let Some(proxy_id) = self.pending.proxy_id_for(idx, &original) {
                self.send_to_client(Message::notification(
                    "$/cancelRequest",
                    Some(json!({"id": proxy_id.to_value()})),
                ))
                .await;
                return;
            }
        }
        tracing::debug!(server = %self.servers[idx].name(), "server cancel for unknown request, dropped");
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Send the client its one response for a finished pending request.
    async fn finish(&mut self, entry: pending::PendingClientRequest) {
        let reply = match entry.mode {
            CompletionMode::Verbatim => entry.collected.into_values().next().unwrap_or_else(|| {
                Reply::err(REQUEST_FAILED, format!("no server answered {}", entry.method))
            }),
            CompletionMode::Merge => self.policy.merge(&entry.method, &entry.collected),
        };
        self.send_to_client(Message::response(entry.client_id, reply)).await;
    }

    async fn on_deadline(&mut self, seq: u64) -> Result<(), ProxyError> {
        // A deadline for an already-completed request is a stale timer.
        let Some(entry) = self.pending.remove(seq) else {
            return Ok(());
        };

        if !entry.outstanding.is_empty() {
            tracing::warn!(
                method = entry.method,
                missing = ?entry.outstanding,
                "deadline reached with servers outstanding"
            );
            if self.opts.drop_tardy {
                self.pending.mark_tardy(&entry);
            }
        }

        if self.init_seq == Some(seq) {
            self.init_seq = None;
            // Initialization is not optional: a partial result only leaves
            // under --drop-tardy, and only when somebody answered.
            let survivable = self.opts.drop_tardy
                && entry.collected.values().any(|reply| !reply.is_error());
            if !entry.outstanding.is_empty() && !survivable {
                let idx = *entry.outstanding.iter().next().expect("non-empty outstanding");
                return Err(ProxyError::InitializeFailed {
                    name: self.servers[idx].name(),
                });
            }
        }

        if entry.state == PendingState::Cancelled {
            self.send_to_client(Message::error_response(
                entry.client_id,
                REQUEST_CANCELLED,
                "request cancelled",
            ))
            .await;
            return Ok(());
        }

        self.finish(entry).await;
        Ok(())
    }

    /// A server's stream closed or its process exited.
    async fn on_server_gone(&mut self, idx: usize) -> Result<Option<i32>, ProxyError> {
        if !self.servers[idx].is_alive() {
            return Ok(None); // EOF and process exit both land here
        }
        self.servers[idx].mark_dead();
        let name = self.servers[idx].name();

        if self.exiting || self.shutting_down {
            tracing::debug!(server = %name, "server wound down");
            if self.exiting && self.servers.iter().all(|s| !s.is_alive()) {
                return Ok(Some(0));
            }
            return Ok(None);
        }

        tracing::error!(server = %name, "server exited unexpectedly");

        // In-flight fan-outs proceed as if this server answered null, so the
        // client still gets its responses before we go down.
        for seq in self.pending.satisfy_dead_server(idx) {
            if let Some(entry) = self.pending.remove(seq) {
                if self.init_seq == Some(seq) {
                    self.init_seq = None;
                }
                self.finish(entry).await;
            }
        }

        if !self.initialized[idx] {
            return Err(ProxyError::InitializeFailed { name });
        }
        Err(ProxyError::ServerDied { name })
    }

    // ── Diagnostics coalescing ───────────────────────────────────────────

    fn schedule_flush(&mut self, uri: String) {
        if !self.scheduled_flushes.insert(uri.clone()) {
            return; // window already running; this update rides along
        }
        let tx = self.events_tx.clone();
        let window = self.opts.coalesce_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(Event::FlushDiagnostics(uri)).await;
        });
    }

    async fn flush_diagnostics(&mut self, uri: &str) {
        self.scheduled_flushes.remove(uri);
        let params = self.policy.merged_diagnostics(uri);
        self.send_to_client(Message::notification(
            "textDocument/publishDiagnostics",
            Some(params),
        ))
        .await;
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    fn schedule_deadline(&self, seq: u64, method: &str) {
        let after = self.policy.request_deadline(method);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Event::Deadline(seq)).await;
        });
    }

    async fn send_to_client(&mut self, msg: Message) {
        if self.client_gone {
            return;
        }
        if !self.client.send(&msg).await {
            tracing::warn!("client outbound closed");
            self.client_gone = true;
        }
    }

    async fn dispatch(&mut self, idx: usize, msg: Message) {
        if !self.servers[idx].is_alive() {
            return;
        }
        if !self.servers[idx].send(&msg).await {
            tracing::warn!(server = %self.servers[idx].name(), "server outbound closed");
            self.servers[idx].mark_dead();
        }
    }

    async fn broadcast(&mut self, msg: Message) {
        for idx in 0..self.servers.len() {
            self.dispatch(idx, msg.clone()).await;
        }
    }

    /// Wind the session down: flush coalesced diagnostics, answer whatever
    /// is still pending, and tell every live server to shut down (unless the
    /// client already drove that sequence itself).
    async fn teardown(&mut self) {
        let uris: Vec<String> = self.scheduled_flushes.drain().collect();
        for uri in uris {
            let params = self.policy.merged_diagnostics(&uri);
            self.send_to_client(Message::notification(
                "textDocument/publishDiagnostics",
                Some(params),
            ))
            .await;
        }

        for seq in self.pending.all_seqs() {
            if let Some(entry) = self.pending.remove(seq) {
                self.send_to_client(Message::error_response(
                    entry.client_id,
                    REQUEST_CANCELLED,
                    "proxy shutting down",
                ))
                .await;
            }
        }

        if !self.exiting {
            for idx in 0..self.servers.len() {
                if !self.servers[idx].is_alive() {
                    continue;
                }
                if !self.shutting_down {
                    let id = self.pending.mint_internal_id();
                    self.dispatch(idx, Message::request(id, "shutdown", None)).await;
                }
                self.dispatch(idx, Message::notification("exit", None)).await;
            }
        }
        // Dropping the endpoints closes every outbound stream once the
        // writers drain; the supervisor handles the grace period and kill.
    }
}
