//! rass — an LSP multiplexing proxy.
//!
//! Sits between a single LSP client and any number of language server
//! subprocesses. To the client it looks like one server; to each server it
//! looks like one client. Requests fan out per an LSP-aware policy, replies
//! are merged under a deadline, ids are rewritten where the peers' id
//! spaces would otherwise collide, and diagnostics from all servers are
//! coalesced into one stream per document.
//!
//! # Architecture
//!
//! - [`transport`]: `Content-Length` framing over byte streams.
//! - [`jsonrpc`]: the message model and classification.
//! - [`endpoint`]: per-peer reader/writer tasks around a transport.
//! - [`router`]: the single-actor multiplexer core.
//! - [`policy`]: the pluggable LSP-aware routing/merging layer.
//! - [`supervisor`]: subprocess spawning, stderr forwarding, teardown.

pub mod cli;
pub mod endpoint;
pub mod error;
pub mod jsonrpc;
pub mod policy;
pub mod router;
pub mod supervisor;
pub mod transport;
