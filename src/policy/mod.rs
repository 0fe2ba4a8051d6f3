//! Routing policy: the LSP-aware layer the router consults.
//!
//! The router is protocol-agnostic about payloads; everything LSP-specific
//! lives behind the [`Policy`] trait: which servers a method goes to, how
//! long the proxy waits for them, and how N replies collapse into one. The
//! default implementation is [`lsp::LspPolicy`]; `--logic-class` selects
//! another entry from the compile-time registry.

pub mod capabilities;
pub mod diagnostics;
pub mod lsp;

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::time::Duration;

use crate::jsonrpc::Reply;

/// How a single client request is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Notification: deliver to every live server verbatim.
    Broadcast,
    /// Request to exactly one server; its response is forwarded unchanged.
    Single(usize),
    /// Request fanned out to the listed servers; replies are collected and
    /// merged (also used for a fan-out that found a single capable server,
    /// because the merge may still rewrite the payload).
    FanOut(Vec<usize>),
    /// No server can serve it, but the method has a well-known empty result.
    EmptyReply(Value),
    /// No server advertises the method.
    MethodNotFound,
    /// Accepted from the client but not forwarded.
    Drop,
}

/// What to do with a notification arriving from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifAction {
    /// Pass through to the client (params may have been rewritten in place).
    Forward,
    /// Diagnostics were folded into the cache; schedule a coalesced flush
    /// for this URI.
    ScheduleDiagnostics(String),
    /// Dropped (stale or tardy; already logged).
    Drop,
}

/// Knobs shared by policy implementations, filled from the CLI.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Aggregation deadline for general requests.
    pub request_timeout: Duration,
    /// Aggregation deadline for `initialize`.
    pub initialize_timeout: Duration,
    /// Per-server diagnostics tardiness threshold.
    pub diagnostic_timeout: Duration,
    /// Discard tardy server output instead of merging it late.
    pub drop_tardy: bool,
}

impl Default for PolicyConfig {
    fn default() -> PolicyConfig {
        PolicyConfig {
            request_timeout: Duration::from_millis(2000),
            initialize_timeout: Duration::from_millis(2500),
            diagnostic_timeout: Duration::from_millis(1000),
            drop_tardy: false,
        }
    }
}

/// The routing/merging decision surface consulted by the router.
///
/// Implementations are stateful: they learn server capabilities during
/// `initialize` and keep whatever caches their merging rules need. All
/// methods are called synchronously from the router task.
pub trait Policy: Send {
    /// Route one client request. May rewrite `params` in place (the router
    /// forwards the rewritten form).
    fn route_request(
        &mut self,
        method: &str,
        params: Option<&mut Value>,
        alive: &[bool],
    ) -> RouteAction;

    /// Deadline for a pending request of this method.
    fn request_deadline(&self, method: &str) -> Duration;

    /// Observe a client notification before it is broadcast (document
    /// version tracking).
    fn observe_client_notification(&mut self, method: &str, params: Option<&Value>);

    /// Observe one server's reply as it is collected. Returns the server's
    /// self-reported name when one is learned.
    fn observe_server_reply(
        &mut self,
        server: usize,
        method: &str,
        reply: &Reply,
    ) -> Option<String>;

    /// Merge the collected replies of a fanned-out request, keyed by server
    /// index. An empty map means every addressed server timed out or died.
    fn merge(&mut self, method: &str, replies: &BTreeMap<usize, Reply>) -> Reply;

    /// Decide what to do with a server notification. May rewrite `params`
    /// in place (message tagging).
    fn server_notification(
        &mut self,
        server: usize,
        method: &str,
        params: Option<&mut Value>,
    ) -> NotifAction;

    /// The merged diagnostics params for a URI whose coalescing window
    /// elapsed.
    fn merged_diagnostics(&mut self, uri: &str) -> Value;
}

/// Look up a policy implementation by registry name.
///
/// `server_names` seeds display names (positional, later replaced by
/// `serverInfo.name`). Returns `None` for an unknown name.
pub fn create_policy(
    name: &str,
    server_names: Vec<String>,
    config: PolicyConfig,
) -> Option<Box<dyn Policy>> {
    match name {
        "lsp" => Some(Box::new(lsp::LspPolicy::new(server_names, config))),
        "passthrough" => Some(Box::new(Passthrough {
            cache: diagnostics::DiagnosticsCache::new(
                config.drop_tardy,
                config.diagnostic_timeout,
            ),
            config,
        })),
        _ => None,
    }
}

/// A policy that knows nothing about LSP: every request goes to the primary
/// server and every server message passes through untouched. Useful for
/// wrapping a single server or debugging the transport path.
struct Passthrough {
    config: PolicyConfig,
    cache: diagnostics::DiagnosticsCache,
}

impl Policy for Passthrough {
    fn route_request(
        &mut self,
        _method: &str,
        _params: Option<&mut Value>,
        alive: &[bool],
    ) -> RouteAction {
        match alive.iter().position(|a| *a) {
            Some(primary) => RouteAction::Single(primary),
            None => RouteAction::MethodNotFound,
        }
    }

    fn request_deadline(&self, method: &str) -> Duration {
        if method == "initialize" {
            self.config.initialize_timeout
        } else {
            self.config.request_timeout
        }
    }

    fn observe_client_notification(&mut self, _method: &str, _params: Option<&Value>) {}

    fn observe_server_reply(
        &mut self,
        _server: usize,
        _method: &str,
        _reply: &Reply,
    ) -> Option<String> {
        None
    }

    fn merge(&mut self, _method: &str, replies: &BTreeMap<usize, Reply>) -> Reply {
        replies
            .values()
            .next()
            .cloned()
            .unwrap_or(Reply::ok(Value::Null))
    }

    fn server_notification(
        &mut self,
        _server: usize,
        _method: &str,
        _params: Option<&mut Value>,
    ) -> NotifAction {
        NotifAction::Forward
    }

    fn merged_diagnostics(&mut self, uri: &str) -> Value {
        self.cache.merged(uri)
    }
}
