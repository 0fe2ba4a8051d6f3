//! Pending-request bookkeeping for the router.
//!
//! Two directions are tracked. A `PendingClientRequest` exists for every
//! client request dispatched to one or more servers, until the merged (or
//! verbatim) response goes back out, the deadline fires, or the client
//! cancels. A `PendingServerRequest` exists for every server-originated
//! request forwarded to the client under a minted id, until the client's
//! response is translated back.
//!
//! Minted ids come from two monotonic counters. Client-bound ids are plain
//! numbers: the only requests the client ever receives come from the proxy,
//! so the space is collision-free by construction. Server-bound ids (the
//! router's own `shutdown` during teardown) share a channel with in-flight
//! client ids, so they are strings under a reserved `rass:` prefix instead.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::jsonrpc::{Reply, RequestId};

/// How a completed pending request is turned into the client's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Single server; its reply is forwarded unchanged.
    Verbatim,
    /// Fan-out; the policy merges the collected replies.
    Merge,
}

/// Lifecycle of a pending client request. Terminal states are implicit in
/// removal from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Dispatched, collecting replies.
    Dispatched,
    /// Client cancelled; the first reply to arrive is forwarded, the rest
    /// are dropped, and the deadline answers `RequestCancelled` if nothing
    /// arrives.
    Cancelled,
}

/// One client request in flight against a set of servers.
#[derive(Debug)]
pub struct PendingClientRequest {
    pub client_id: RequestId,
    pub method: String,
    pub mode: CompletionMode,
    pub state: PendingState,
    /// Servers the request was dispatched to.
    pub addressed: BTreeSet<usize>,
    /// Servers that have not replied yet.
    pub outstanding: BTreeSet<usize>,
    /// Replies collected so far, keyed by server index.
    pub collected: BTreeMap<usize, Reply>,
}

/// One server-originated request forwarded to the client.
#[derive(Debug)]
pub struct PendingServerRequest {
    pub server: usize,
    pub original_id: RequestId,
}

/// All in-flight request state, owned by the router task.
#[derive(Default)]
pub struct PendingTables {
    next_seq: u64,
    by_seq: HashMap<u64, PendingClientRequest>,
    by_server_id: HashMap<(usize, RequestId), u64>,
    by_client_id: HashMap<RequestId, u64>,
    to_client: HashMap<RequestId, PendingServerRequest>,
    next_proxy_id: i64,
    next_internal_id: u64,
    tardy: HashSet<(usize, RequestId)>,
}

impl PendingTables {
    /// Track a freshly dispatched client request. Returns its sequence
    /// number, which also keys the deadline timer.
    pub fn insert(
        &mut self,
        client_id: RequestId,
        method: String,
        mode: CompletionMode,
        targets: &[usize],
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let addressed: BTreeSet<usize> = targets.iter().copied().collect();
        for &server in &addressed {
            self.by_server_id.insert((server, client_id.clone()), seq);
        }
        self.by_client_id.insert(client_id.clone(), seq);
        self.by_seq.insert(
            seq,
            PendingClientRequest {
                client_id,
                method,
                mode,
                state: PendingState::Dispatched,
                outstanding: addressed.clone(),
                addressed,
                collected: BTreeMap::new(),
            },
        );
        seq
    }

    /// Resolve a server's response to the pending request it answers.
    pub fn seq_for_server_response(&self, server: usize, id: &RequestId) -> Option<u64> {
        self.by_server_id.get(&(server, id.clone())).copied()
    }

    /// Resolve a client-side id (from `$/cancelRequest`) to its pending
    /// request.
    pub fn seq_for_client_id(&self, id: &RequestId) -> Option<u64> {
        self.by_client_id.get(id).copied()
    }

    pub fn get(&self, seq: u64) -> Option<&PendingClientRequest> {
        self.by_seq.get(&seq)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut PendingClientRequest> {
        self.by_seq.get_mut(&seq)
    }

    /// Record one server's reply. Returns `true` when no servers remain
    /// outstanding.
    pub fn record_reply(&mut self, seq: u64, server: usize, reply: Reply) -> bool {
        let Some(entry) = self.by_seq.get_mut(&seq) else {
            return false;
        };
        entry.outstanding.remove(&server);
        entry.collected.insert(server, reply);
        entry.outstanding.is_empty()
    }

    /// Retire a pending request, dropping all of its index entries.
    pub fn remove(&mut self, seq: u64) -> Option<PendingClientRequest> {
        let entry = self.by_seq.remove(&seq)?;
        for server in &entry.addressed {
            self.by_server_id.remove(&(*server, entry.client_id.clone()));
        }
        self.by_client_id.remove(&entry.client_id);
        Some(entry)
    }

    /// Remember that these servers' replies are expected to arrive after
    /// their request was already retired, so the late arrival can be logged
    /// as tardy rather than unknown.
    pub fn mark_tardy(&mut self, entry: &PendingClientRequest) {
        for &server in &entry.outstanding {
            self.tardy.insert((server, entry.client_id.clone()));
        }
    }

    /// Check-and-clear the tardy marker for an arriving response.
    pub fn take_tardy(&mut self, server: usize, id: &RequestId) -> bool {
        self.tardy.remove(&(server, id.clone()))
    }

    /// Inject a null reply for every request still waiting on a dead
    /// server. Returns the sequence numbers that became complete.
    pub fn satisfy_dead_server(&mut self, server: usize) -> Vec<u64> {
        let mut completed = Vec::new();
        for (&seq, entry) in self.by_seq.iter_mut() {
            if entry.outstanding.remove(&server) {
                entry.collected.insert(server, Reply::ok(serde_json::Value::Null));
                if entry.outstanding.is_empty() {
                    completed.push(seq);
                }
            }
        }
        completed.sort_unstable();
        completed
    }

    /// All live sequence numbers (teardown sweep).
    pub fn all_seqs(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.by_seq.keys().copied().collect();
        seqs.sort_unstable();
        seqs
    }

    /// Mint a client-bound id for a server-originated request.
    pub fn mint_proxy_id(&mut self) -> RequestId {
        let id = self.next_proxy_id;
        self.next_proxy_id += 1;
        RequestId::Number(id)
    }

    /// Mint a server-bound id for a router-originated request.
    pub fn mint_internal_id(&mut self) -> RequestId {
        let id = self.next_internal_id;
        self.next_internal_id += 1;
        RequestId::Str(format!("rass:shutdown:{id}"))
    }

    /// Track a server-originated request forwarded under `proxy_id`.
    pub fn insert_server_request(
        &mut self,
        proxy_id: RequestId,
        server: usize,
        original_id: RequestId,
    ) {
        self.to_client
            .insert(proxy_id, PendingServerRequest { server, original_id });
    }

    /// Resolve the client's response to a forwarded server request.
    pub fn remove_server_request(&mut self, proxy_id: &RequestId) -> Option<PendingServerRequest> {
        self.to_client.remove(proxy_id)
    }

    /// Find the minted id for a server's own request (server-side cancel).
    pub fn proxy_id_for(&self, server: usize, original_id: &RequestId) -> Option<RequestId> {
        self.to_client
            .iter()
            .find(|(_, p)| p.server == server && p.original_id == *original_id)
            .map(|(id, _)| id.clone())
    }
}
