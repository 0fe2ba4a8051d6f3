//! The default LSP policy: routing table, response merging, diagnostics
//! aggregation, and code-action data cookies.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};
use tokio::time::Duration;

use crate::jsonrpc::Reply;
use crate::policy::capabilities::{advertises, merge_capabilities, merge_server_info, provider_key};
use crate::policy::diagnostics::{DiagnosticsCache, PublishOutcome};
use crate::policy::{NotifAction, Policy, PolicyConfig, RouteAction};

/// Methods fanned out to every capable server with results merged.
const FAN_OUT_METHODS: &[&str] = &[
    "textDocument/codeAction",
    "textDocument/definition",
    "textDocument/references",
    "textDocument/implementation",
    "textDocument/typeDefinition",
    "textDocument/declaration",
];

/// Methods whose result arrays are deduplicated by `(uri, range)`.
const LOCATION_METHODS: &[&str] = &[
    "textDocument/definition",
    "textDocument/references",
    "textDocument/implementation",
    "textDocument/typeDefinition",
    "textDocument/declaration",
];

/// Prefix of minted data-cookie ids.
const COOKIE_PREFIX: &str = "rass-";

/// LSP-aware routing and merging.
pub struct LspPolicy {
    config: PolicyConfig,
    server_names: Vec<String>,
    /// Per-server capability tables learned from `initialize`.
    capabilities: Vec<Option<Value>>,
    diags: DiagnosticsCache,
    /// Stashed code-action `data` payloads: cookie id → (owner, original).
    cookies: HashMap<String, (usize, Value)>,
    cookie_counter: u64,
}

impl LspPolicy {
    pub fn new(server_names: Vec<String>, config: PolicyConfig) -> LspPolicy {
        let count = server_names.len();
        LspPolicy {
            diags: DiagnosticsCache::new(config.drop_tardy, config.diagnostic_timeout),
            config,
            server_names,
            capabilities: vec![None; count],
            cookies: HashMap::new(),
            cookie_counter: 0,
        }
    }

    fn capable(&self, server: usize, method: &str) -> bool {
        self.capabilities
            .get(server)
            .and_then(Option::as_ref)
            .is_some_and(|caps| advertises(caps, method))
    }

    fn capable_servers(&self, method: &str, alive: &[bool]) -> Vec<usize> {
        (0..self.server_names.len())
            .filter(|&i| alive.get(i) == Some(&true) && self.capable(i, method))
            .collect()
    }

    /// Replace a code action's `data` with a minted cookie so a later
    /// resolve request can be routed back to the owning server.
    fn stash_data(&mut self, action: &mut Value, server: usize) {
        let Some(obj) = action.as_object_mut() else {
            return;
        };
        let Some(data) = obj.remove("data") else {
            return;
        };
        self.cookie_counter += 1;
        let id = format!("{COOKIE_PREFIX}{}", self.cookie_counter);
        self.cookies.insert(id.clone(), (server, data));
        obj.insert("data".to_string(), json!(id));
    }

    fn merge_initialize(&mut self, replies: &BTreeMap<usize, Reply>) -> Reply {
        let successes: Vec<(usize, &Value)> = replies
            .iter()
            .filter(|(_, r)| !r.is_error())
            .filter_map(|(i, r)| r.result.as_ref().map(|v| (*i, v)))
            .collect();
        let Some((_, base)) = successes.first() else {
            return first_error(replies);
        };

        let mut merged = (*base).clone();
        let caps = merge_capabilities(
            successes
                .iter()
                .filter_map(|(_, result)| result.get("capabilities")),
        );
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("capabilities".to_string(), caps);
            match merge_server_info(
                successes
                    .iter()
                    .filter_map(|(_, result)| result.get("serverInfo")),
            ) {
                Some(info) => {
                    obj.insert("serverInfo".to_string(), info);
                }
                None => {
                    obj.remove("serverInfo");
                }
            }
        }
        Reply::ok(merged)
    }

    fn merge_code_actions(&mut self, replies: &BTreeMap<usize, Reply>) -> Reply {
        let mut actions: Vec<Value> = Vec::new();
        for (&server, reply) in replies {
            if reply.is_error() {
                continue;
            }
            for action in as_list(reply.result.as_ref()) {
                let mut action = action.clone();
                self.stash_data(&mut action, server);
                actions.push(action);
            }
        }
        Reply::ok(Value::Array(actions))
    }

    fn merge_locations(&mut self, replies: &BTreeMap<usize, Reply>) -> Reply {
        let mut seen: Vec<String> = Vec::new();
        let mut locations: Vec<Value> = Vec::new();
        for reply in replies.values() {
            if reply.is_error() {
                continue;
            }
            for location in as_list(reply.result.as_ref()) {
                let key = location_key(location);
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                locations.push(location.clone());
            }
        }
        if locations.is_empty() {
            return Reply::ok(Value::Null);
        }
        Reply::ok(Value::Array(locations))
    }
}

impl Policy for LspPolicy {
    fn route_request(
        &mut self,
        method: &str,
        params: Option<&mut Value>,
        alive: &[bool],
    ) -> RouteAction {
        // Cookie recovery first: a request carrying a minted `data` id (a
        // codeAction/resolve, typically) goes back to the server that
        // produced the data, with the original payload restored.
        if let Some(params) = params {
            let cookie = params
                .get("data")
                .and_then(Value::as_str)
                .filter(|s| s.starts_with(COOKIE_PREFIX))
                .map(str::to_string);
            if let Some(id) = cookie {
                if let Some((owner, original)) = self.cookies.get(&id) {
                    let owner = *owner;
                    let original = original.clone();
                    if let Some(obj) = params.as_object_mut() {
                        obj.insert("data".to_string(), original);
                    }
                    if alive.get(owner) == Some(&true) {
                        return RouteAction::Single(owner);
                    }
                    return RouteAction::EmptyReply(Value::Null);
                }
            }
        }

        if method == "initialize" || method == "shutdown" {
            let all: Vec<usize> = (0..self.server_names.len())
                .filter(|&i| alive.get(i) == Some(&true))
                .collect();
            if all.is_empty() {
                return RouteAction::EmptyReply(Value::Null);
            }
            return RouteAction::FanOut(all);
        }

        if FAN_OUT_METHODS.contains(&method) {
            let targets = self.capable_servers(method, alive);
            if targets.is_empty() {
                let empty = if method == "textDocument/codeAction" {
                    json!([])
                } else {
                    Value::Null
                };
                return RouteAction::EmptyReply(empty);
            }
            return RouteAction::FanOut(targets);
        }

        // Anything with an advertised provider is single-authoritative:
        // lowest-indexed capable server wins.
        if provider_key(method).is_some() {
            return match self.capable_servers(method, alive).first() {
                Some(&server) => RouteAction::Single(server),
                None => RouteAction::MethodNotFound,
            };
        }

        // Everything else goes to the primary server.
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

    fn observe_client_notification(&mut self, method: &str, params: Option<&Value>) {
        match method {
            "textDocument/didOpen" | "textDocument/didChange" => self.diags.track_document(params),
            "textDocument/didClose" => self.diags.forget_document(params),
            _ => {}
        }
    }

    fn observe_server_reply(
        &mut self,
        server: usize,
        method: &str,
        reply: &Reply,
    ) -> Option<String> {
        if method != "initialize" || reply.is_error() {
            return None;
        }
        let result = reply.result.as_ref()?;
        if let Some(caps) = result.get("capabilities") {
            self.capabilities[server] = Some(caps.clone());
        }
        let name = result
            .get("serverInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)?;
        self.server_names[server] = name.to_string();
        Some(name.to_string())
    }

    fn merge(&mut self, method: &str, replies: &BTreeMap<usize, Reply>) -> Reply {
        if replies.is_empty() {
            let empty = match method {
                "textDocument/codeAction" => json!([]),
                _ => Value::Null,
            };
            return Reply::ok(empty);
        }
        if replies.values().all(Reply::is_error) && method != "shutdown" {
            return first_error(replies);
        }
        match method {
            "initialize" => self.merge_initialize(replies),
            // Shutdown's payload is null; errors collapse into success
            // unless every server failed, and all-failed still answers the
            // client (the session is ending either way).
            "shutdown" => Reply::ok(Value::Null),
            "textDocument/codeAction" => self.merge_code_actions(replies),
            m if LOCATION_METHODS.contains(&m) => self.merge_locations(replies),
            _ => replies
                .values()
                .find(|r| !r.is_error())
                .cloned()
                .unwrap_or(Reply::ok(Value::Null)),
        }
    }

    fn server_notification(
        &mut self,
        server: usize,
        method: &str,
        params: Option<&mut Value>,
    ) -> NotifAction {
        let name = self
            .server_names
            .get(server)
            .cloned()
            .unwrap_or_else(|| format!("s{server}"));

        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else {
                    return NotifAction::Drop;
                };
                match self.diags.record_publish(server, &name, params) {
                    PublishOutcome::Merge => {
                        let uri = params
                            .get("uri")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        NotifAction::ScheduleDiagnostics(uri)
                    }
                    PublishOutcome::Stale => {
                        tracing::debug!(server = %name, "stale diagnostics dropped");
                        NotifAction::Drop
                    }
                    PublishOutcome::Tardy => {
                        tracing::warn!(server = %name, "tardy diagnostics discarded");
                        NotifAction::Drop
                    }
                    PublishOutcome::Malformed => {
                        tracing::warn!(server = %name, "publishDiagnostics without uri dropped");
                        NotifAction::Drop
                    }
                }
            }
            "window/showMessage" | "window/logMessage" | "$/progress" => {
                if let Some(params) = params {
                    tag_message(params, &name);
                }
                NotifAction::Forward
            }
            _ => NotifAction::Forward,
        }
    }

    fn merged_diagnostics(&mut self, uri: &str) -> Value {
        self.diags.merged(uri)
    }
}

/// Prefix `[name] ` onto whichever message text the params carry.
fn tag_message(params: &mut Value, name: &str) {
    let target = if params.get("message").is_some() {
        params.get_mut("message")
    } else {
        // `$/progress` nests its text under `value`.
        params.get_mut("value").and_then(|v| v.get_mut("message"))
    };
    if let Some(Value::String(message)) = target {
        *message = format!("[{name}] {message}");
    }
}

/// The first error reply, for the all-failed case.
fn first_error(replies: &BTreeMap<usize, Reply>) -> Reply {
    replies
        .values()
        .find(|r| r.is_error())
        .cloned()
        .unwrap_or(Reply::ok(Value::Null))
}

/// Normalize a result payload to a list: `null` is empty, a bare object is a
/// singleton, an array is itself.
fn as_list(result: Option<&Value>) -> &[Value] {
    match result {
        Some(Value::Array(items)) => items.as_slice(),
        Some(v @ Value::Object(_)) => std::slice::from_ref(v),
        _ => &[],
    }
}

/// Dedup key for a definition-family element: `(uri, range)`, tolerating the
/// `LocationLink` field names.
fn location_key(location: &Value) -> String {
    let uri = location.get("uri").or_else(|| location.get("targetUri"));
    let range = location
        .get("range")
        .or_else(|| location.get("targetRange"));
    match (uri, range) {
        (Some(uri), Some(range)) => json!([uri, range]).to_string(),
        _ => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(n: usize) -> LspPolicy {
        let names = (0..n).map(|i| format!("s{i}")).collect();
        LspPolicy::new(names, PolicyConfig::default())
    }

    fn learn(policy: &mut LspPolicy, server: usize, caps: Value) {
        policy.observe_server_reply(
            server,
            "initialize",
            &Reply::ok(json!({"capabilities": caps})),
        );
    }

    #[test]
    fn rename_goes_to_first_capable() {
        let mut p = policy(3);
        learn(&mut p, 0, json!({}));
        learn(&mut p, 1, json!({"renameProvider": true}));
        learn(&mut p, 2, json!({"renameProvider": true}));
        assert_eq!(
            p.route_request("textDocument/rename", None, &[true, true, true]),
            RouteAction::Single(1)
        );
    }

    #[test]
    fn rename_without_any_provider_is_method_not_found() {
        let mut p = policy(2);
        learn(&mut p, 0, json!({}));
        learn(&mut p, 1, json!({}));
        assert_eq!(
            p.route_request("textDocument/rename", None, &[true, true]),
            RouteAction::MethodNotFound
        );
    }

    #[test]
    fn code_action_fans_out_to_capable_only() {
        let mut p = policy(3);
        learn(&mut p, 0, json!({}));
        learn(&mut p, 1, json!({"codeActionProvider": true}));
        learn(&mut p, 2, json!({"codeActionProvider": {"codeActionKinds": []}}));
        assert_eq!(
            p.route_request("textDocument/codeAction", None, &[true, true, true]),
            RouteAction::FanOut(vec![1, 2])
        );
    }

    #[test]
    fn code_action_with_no_capable_servers_is_empty_list() {
        let mut p = policy(1);
        learn(&mut p, 0, json!({}));
        assert_eq!(
            p.route_request("textDocument/codeAction", None, &[true]),
            RouteAction::EmptyReply(json!([]))
        );
    }

    #[test]
    fn definition_with_no_capable_servers_is_null() {
        let mut p = policy(1);
        learn(&mut p, 0, json!({}));
        assert_eq!(
            p.route_request("textDocument/definition", None, &[true]),
            RouteAction::EmptyReply(Value::Null)
        );
    }

    #[test]
    fn dead_servers_are_skipped() {
        let mut p = policy(2);
        learn(&mut p, 0, json!({"renameProvider": true}));
        learn(&mut p, 1, json!({"renameProvider": true}));
        assert_eq!(
            p.route_request("textDocument/rename", None, &[false, true]),
            RouteAction::Single(1)
        );
    }

    #[test]
    fn unlisted_method_goes_to_primary() {
        let mut p = policy(2);
        assert_eq!(
            p.route_request("workspace/didCreateFiles", None, &[true, true]),
            RouteAction::Single(0)
        );
    }

    #[test]
    fn initialize_fans_out_to_all_live() {
        let mut p = policy(3);
        assert_eq!(
            p.route_request("initialize", None, &[true, false, true]),
            RouteAction::FanOut(vec![0, 2])
        );
    }

    #[test]
    fn merge_code_actions_concatenates_in_server_order() {
        let mut p = policy(3);
        let mut replies = BTreeMap::new();
        replies.insert(2, Reply::ok(json!([{"title": "C"}])));
        replies.insert(1, Reply::ok(json!([{"title": "A"}, {"title": "B"}])));
        let merged = p.merge("textDocument/codeAction", &replies);
        let actions = merged.result.unwrap();
        let titles: Vec<&str> = actions
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn merge_code_actions_skips_error_replies() {
        let mut p = policy(2);
        let mut replies = BTreeMap::new();
        replies.insert(0, Reply::err(-32603, "boom"));
        replies.insert(1, Reply::ok(json!([{"title": "A"}])));
        let merged = p.merge("textDocument/codeAction", &replies);
        assert_eq!(merged.result.unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn code_action_data_round_trips_through_cookie() {
        let mut p = policy(2);
        learn(&mut p, 0, json!({"codeActionProvider": true}));
        learn(&mut p, 1, json!({"codeActionProvider": true}));

        let mut replies = BTreeMap::new();
        replies.insert(1, Reply::ok(json!([{"title": "fix", "data": {"secret": 7}}])));
        let merged = p.merge("textDocument/codeAction", &replies);
        let actions = merged.result.unwrap();
        let cookie = actions[0]["data"].as_str().unwrap().to_string();
        assert!(cookie.starts_with(COOKIE_PREFIX));

        // Resolving with the cookie routes to the owning server and
        // restores the original payload.
        let mut params = json!({"title": "fix", "data": cookie});
        let action = p.route_request("codeAction/resolve", Some(&mut params), &[true, true]);
        assert_eq!(action, RouteAction::Single(1));
        assert_eq!(params["data"], json!({"secret": 7}));
    }

    #[test]
    fn merge_definitions_normalizes_and_dedups() {
        let mut p = policy(5);
        let r1 = json!({"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 4}});
        let r2 = json!({"start": {"line": 9, "character": 0}, "end": {"line": 9, "character": 4}});
        let mut replies = BTreeMap::new();
        replies.insert(1, Reply::ok(json!([{"uri": "file:///u", "range": r1}])));
        replies.insert(2, Reply::ok(json!({"uri": "file:///u", "range": r2})));
        replies.insert(3, Reply::ok(json!([{"uri": "file:///u", "range": r1}])));
        replies.insert(4, Reply::ok(json!({"uri": "file:///u", "range": r1})));

        let merged = p.merge("textDocument/definition", &replies);
        let locations = merged.result.unwrap();
        let locations = locations.as_array().unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0]["range"], r1);
        assert_eq!(locations[1]["range"], r2);
    }

    #[test]
    fn merge_definitions_null_results_are_empty() {
        let mut p = policy(2);
        let mut replies = BTreeMap::new();
        replies.insert(0, Reply::ok(Value::Null));
        replies.insert(1, Reply::ok(Value::Null));
        let merged = p.merge("textDocument/definition", &replies);
        assert_eq!(merged.result, Some(Value::Null));
    }

    #[test]
    fn merge_initialize_combines_capabilities_and_server_info() {
        let mut p = policy(2);
        let mut replies = BTreeMap::new();
        replies.insert(
            0,
            Reply::ok(json!({
                "capabilities": {"textDocumentSync": 2, "hoverProvider": true},
                "serverInfo": {"name": "alpha", "version": "1"},
            })),
        );
        replies.insert(
            1,
            Reply::ok(json!({
                "capabilities": {"textDocumentSync": 1, "renameProvider": true},
                "serverInfo": {"name": "beta", "version": "2"},
            })),
        );
        let merged = p.merge("initialize", &replies);
        let result = merged.result.unwrap();
        assert_eq!(result["capabilities"]["textDocumentSync"], json!(1));
        assert_eq!(result["capabilities"]["hoverProvider"], json!(true));
        assert_eq!(result["capabilities"]["renameProvider"], json!(true));
        assert_eq!(result["serverInfo"]["name"], "alpha+beta");
        assert_eq!(result["serverInfo"]["version"], "1,2");
    }

    #[test]
    fn merge_shutdown_collapses_errors() {
        let mut p = policy(2);
        let mut replies = BTreeMap::new();
        replies.insert(0, Reply::ok(Value::Null));
        replies.insert(1, Reply::err(-32603, "already down"));
        let merged = p.merge("shutdown", &replies);
        assert!(!merged.is_error());
    }

    #[test]
    fn merge_all_errors_surfaces_first_error() {
        let mut p = policy(2);
        let mut replies = BTreeMap::new();
        replies.insert(0, Reply::err(-32603, "a"));
        replies.insert(1, Reply::err(-32603, "b"));
        let merged = p.merge("textDocument/codeAction", &replies);
        assert!(merged.is_error());
        assert_eq!(merged.error.unwrap()["message"], "a");
    }

    #[test]
    fn observe_initialize_learns_name_and_capabilities() {
        let mut p = policy(2);
        let learned = p.observe_server_reply(
            1,
            "initialize",
            &Reply::ok(json!({
                "capabilities": {"hoverProvider": true},
                "serverInfo": {"name": "beta-ls"},
            })),
        );
        assert_eq!(learned.as_deref(), Some("beta-ls"));
        assert!(p.capable(1, "textDocument/hover"));
    }

    #[test]
    fn show_message_is_tagged_with_server_name() {
        let mut p = policy(1);
        let mut params = json!({"type": 3, "message": "indexing done"});
        let action = p.server_notification(0, "window/showMessage", Some(&mut params));
        assert_eq!(action, NotifAction::Forward);
        assert_eq!(params["message"], "[s0] indexing done");
    }

    #[test]
    fn progress_message_is_tagged_under_value() {
        let mut p = policy(1);
        let mut params = json!({"token": "t", "value": {"kind": "report", "message": "50%"}});
        p.server_notification(0, "$/progress", Some(&mut params));
        assert_eq!(params["value"]["message"], "[s0] 50%");
    }

    #[test]
    fn diagnostics_schedule_by_uri() {
        let mut p = policy(2);
        let mut params = json!({"uri": "file:///a.py", "version": 1, "diagnostics": []});
        let action =
            p.server_notification(0, "textDocument/publishDiagnostics", Some(&mut params));
        assert_eq!(
            action,
            NotifAction::ScheduleDiagnostics("file:///a.py".to_string())
        );
    }
}
