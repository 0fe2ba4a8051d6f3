//! Server capability inspection and merging.
//!
//! The merged `ServerCapabilities` object handed to the client has to be
//! consumable by every backend at once, so the rules are asymmetric:
//! booleans OR (any server able to do it means the proxy can), while
//! `textDocumentSync` takes the minimum sync kind (the client must send
//! document updates in the form every server can consume; `Full = 1` wins
//! over `Incremental = 2`). Option objects union their fields with the
//! primary server winning scalar conflicts, and trigger-character lists
//! union.

use serde_json::{Map, Value};

/// Map a request method to the capability field that advertises it.
pub fn provider_key(method: &str) -> Option<&'static str> {
    Some(match method {
        "textDocument/hover" => "hoverProvider",
        "textDocument/completion" => "completionProvider",
        "textDocument/signatureHelp" => "signatureHelpProvider",
        "textDocument/rename" => "renameProvider",
        "textDocument/formatting" => "documentFormattingProvider",
        "textDocument/rangeFormatting" => "documentRangeFormattingProvider",
        "textDocument/codeAction" => "codeActionProvider",
        "textDocument/definition" => "definitionProvider",
        "textDocument/declaration" => "declarationProvider",
        "textDocument/typeDefinition" => "typeDefinitionProvider",
        "textDocument/implementation" => "implementationProvider",
        "textDocument/references" => "referencesProvider",
        "textDocument/documentHighlight" => "documentHighlightProvider",
        "textDocument/documentSymbol" => "documentSymbolProvider",
        "textDocument/codeLens" => "codeLensProvider",
        "textDocument/documentLink" => "documentLinkProvider",
        "textDocument/documentColor" => "colorProvider",
        "textDocument/foldingRange" => "foldingRangeProvider",
        "textDocument/selectionRange" => "selectionRangeProvider",
        "textDocument/semanticTokens/full" | "textDocument/semanticTokens/range" => {
            "semanticTokensProvider"
        }
        "textDocument/inlayHint" => "inlayHintProvider",
        "textDocument/linkedEditingRange" => "linkedEditingRangeProvider",
        "textDocument/moniker" => "monikerProvider",
        "textDocument/prepareCallHierarchy" => "callHierarchyProvider",
        "workspace/symbol" => "workspaceSymbolProvider",
        "workspace/executeCommand" => "executeCommandProvider",
        _ => return None,
    })
}

/// Whether a capability table advertises support for `method`.
///
/// A provider value of `false` or `null` counts as absent; `true` and option
/// objects count as present.
pub fn advertises(caps: &Value, method: &str) -> bool {
    let Some(key) = provider_key(method) else {
        return false;
    };
    match caps.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

/// Merge capability tables, given in server order (primary first).
pub fn merge_capabilities<'a>(tables: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut merged = Map::new();
    let mut sync_values: Vec<Value> = Vec::new();

    for caps in tables {
        let Some(caps) = caps.as_object() else {
            continue;
        };
        for (key, value) in caps {
            if key == "textDocumentSync" {
                sync_values.push(value.clone());
                continue;
            }
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(existing) => merge_value(existing, value),
            }
        }
    }

    if let Some(sync) = pick_minimum_sync(&sync_values) {
        merged.insert("textDocumentSync".to_string(), sync);
    }

    Value::Object(merged)
}

/// Merge `serverInfo` objects in server order into a synthetic one: names
/// joined with `+`, versions with `,`, primary first.
pub fn merge_server_info<'a>(infos: impl IntoIterator<Item = &'a Value>) -> Option<Value> {
    let mut names: Vec<&str> = Vec::new();
    let mut versions: Vec<&str> = Vec::new();
    for info in infos {
        if let Some(name) = info.get("name").and_then(Value::as_str) {
            names.push(name);
        }
        if let Some(version) = info.get("version").and_then(Value::as_str) {
            versions.push(version);
        }
    }
    if names.is_empty() && versions.is_empty() {
        return None;
    }
    let mut merged = Map::new();
    if !names.is_empty() {
        merged.insert("name".to_string(), Value::String(names.join("+")));
    }
    if !versions.is_empty() {
        merged.insert("version".to_string(), Value::String(versions.join(",")));
    }
    Some(Value::Object(merged))
}

/// The sync kind a `textDocumentSync` value declares: a bare number is the
/// kind itself, an options object declares it in `change`.
pub fn sync_kind(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Object(obj) => obj.get("change").and_then(Value::as_i64),
        _ => None,
    }
}

/// Pick the declared sync value with the minimum kind; `None = 0` loses to
/// nothing (a server that declared no sync does not constrain the rest).
fn pick_minimum_sync(values: &[Value]) -> Option<Value> {
    let min = values.iter().filter_map(sync_kind).min();
    match min {
        Some(min) => values
            .iter()
            .find(|v| sync_kind(v) == Some(min))
            .cloned(),
        // No value declared a kind; keep the first declared shape, if any.
        None => values.first().cloned(),
    }
}

/// Merge one capability value into the accumulated one. Earlier servers are
/// more primary, so the existing value wins scalar conflicts; non-scalars
/// win over scalars; booleans OR; arrays union; objects merge per key.
fn merge_value(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(key) {
                    None => {
                        a.insert(key.clone(), value.clone());
                    }
                    Some(slot) => merge_value(slot, value),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for item in b {
                if !a.contains(item) {
                    a.push(item.clone());
                }
            }
        }
        (Value::Bool(a), Value::Bool(b)) => {
            *a = *a || *b;
        }
        // A scalar loses to an option object or array.
        (a, b) if is_scalar(a) && !is_scalar(b) => {
            *a = b.clone();
        }
        // Otherwise the more-primary value stands.
        _ => {}
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}
