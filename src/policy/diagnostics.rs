//! Stateful, per-URI diagnostics aggregation.
//!
//! Diagnostics are the one notification the proxy cannot pass through: each
//! server publishes its own set for a document, and the client would treat
//! every publish as the complete truth, flickering between servers. The
//! cache keeps the latest set per `(server, uri)` and re-emits one merged
//! publish containing every server's current diagnostics for that URI.
//!
//! Staleness is judged two ways: against the last version seen from the same
//! server for the URI, and against the document version the client last sent
//! in `didOpen`/`didChange`. Tardiness is judged against the time of that
//! `didChange`.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};
use tokio::time::{Duration, Instant};

/// What to do with one incoming `publishDiagnostics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Cache updated; a merged publish for this URI should be (re)scheduled.
    Merge,
    /// Older than something already seen; dropped.
    Stale,
    /// Arrived past the tardiness threshold with `--drop-tardy` on; dropped.
    Tardy,
    /// Params carry no usable `uri`; dropped.
    Malformed,
}

struct Slot {
    version: Option<i64>,
    diagnostics: Vec<Value>,
}

struct DocState {
    version: i64,
    changed_at: Instant,
}

/// Latest diagnostics per `(server, uri)` plus document version tracking.
pub struct DiagnosticsCache {
    // BTreeMap keyed by (server, uri) so merged() walks servers in index
    // order, which fixes the merged array's order.
    slots: BTreeMap<(usize, String), Slot>,
    doc_versions: HashMap<String, DocState>,
    drop_tardy: bool,
    tardy_after: Duration,
}

impl DiagnosticsCache {
    pub fn new(drop_tardy: bool, tardy_after: Duration) -> DiagnosticsCache {
        DiagnosticsCache {
            slots: BTreeMap::new(),
            doc_versions: HashMap::new(),
            drop_tardy,
            tardy_after,
        }
    }

    /// Record the document version from a `didOpen`/`didChange`. Starts the
    /// tardiness clock for that version.
    pub fn track_document(&mut self, params: Option<&Value>) {
        let Some(doc) = params.and_then(|p| p.get("textDocument")) else {
            return;
        };
        let Some(uri) = doc.get("uri").and_then(Value::as_str) else {
            return;
        };
        let Some(version) = doc.get("version").and_then(Value::as_i64) else {
            return;
        };
        self.doc_versions.insert(
            uri.to_string(),
            DocState {
                version,
                changed_at: Instant::now(),
            },
        );
    }

    /// Drop tracking state for a closed document.
    pub fn forget_document(&mut self, params: Option<&Value>) {
        let Some(uri) = params
            .and_then(|p| p.get("textDocument"))
            .and_then(|d| d.get("uri"))
            .and_then(Value::as_str)
        else {
            return;
        };
        self.doc_versions.remove(uri);
        self.slots.retain(|(_, slot_uri), _| slot_uri != uri);
    }

    /// Fold one server's publish into the cache.
    pub fn record_publish(
        &mut self,
        server: usize,
        server_name: &str,
        params: &Value,
    ) -> PublishOutcome {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return PublishOutcome::Malformed;
        };
        let version = params.get("version").and_then(Value::as_i64);

        let key = (server, uri.to_string());
        if let (Some(new), Some(Slot {
            version: Some(old), ..
        })) = (version, self.slots.get(&key))
        {
            if new < *old {
                return PublishOutcome::Stale;
            }
        }

        if let Some(doc) = self.doc_versions.get(uri) {
            if let Some(new) = version {
                if new < doc.version {
                    return PublishOutcome::Stale;
                }
            }
            // Tardiness applies to the current document version only; a
            // publish for a version the client has not sent yet cannot be
            // late.
            let current = version.is_none_or(|v| v == doc.version);
            if self.drop_tardy && current && doc.changed_at.elapsed() > self.tardy_after {
                return PublishOutcome::Tardy;
            }
        }

        let mut diagnostics: Vec<Value> = params
            .get("diagnostics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for diag in &mut diagnostics {
            if let Some(obj) = diag.as_object_mut() {
                obj.entry("source")
                    .or_insert_with(|| json!(server_name));
            }
        }

        self.slots.insert(
            key,
            Slot {
                version,
                diagnostics,
            },
        );
        PublishOutcome::Merge
    }

    /// Build the merged publish params for a URI: every server's latest
    /// diagnostics concatenated in server order. The `version` field is the
    /// maximum seen, and only present when every contributing server sent
    /// one.
    pub fn merged(&self, uri: &str) -> Value {
        let mut diagnostics: Vec<Value> = Vec::new();
        let mut versions: Vec<Option<i64>> = Vec::new();
        for ((_, slot_uri), slot) in &self.slots {
            if slot_uri == uri {
                diagnostics.extend(slot.diagnostics.iter().cloned());
                versions.push(slot.version);
            }
        }

        let mut params = Map::new();
        params.insert("uri".to_string(), json!(uri));
        params.insert("diagnostics".to_string(), Value::Array(diagnostics));
        if !versions.is_empty() && versions.iter().all(Option::is_some) {
            let max = versions.iter().flatten().max().copied();
            params.insert("version".to_string(), json!(max));
        }
        Value::Object(params)
    }
}
