//! Error types for the proxy.
//!
//! `FramingError` covers wire-level failures while decoding a single framed
//! JSON-RPC message: malformed headers, truncated bodies, non-JSON payloads,
//! and version violations. A framing error is fatal for the endpoint it
//! occurred on, and fatal for the whole process when that endpoint is the
//! client.
//!
//! `ProxyError` covers process-level failures: server spawn errors, fatal
//! framing, initialization failures, and the client disappearing.

use crate::endpoint::Source;

/// Errors produced while decoding a framed JSON-RPC message.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A header line is not `Name: value`.
    #[error("malformed header line: {line:?}")]
    MalformedHeader {
        /// The offending line, trimmed.
        line: String,
    },

    /// The header block ended without a `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The `Content-Length` value is not a non-negative integer.
    #[error("invalid Content-Length value: {value:?}")]
    InvalidContentLength {
        /// The value as it appeared on the wire.
        value: String,
    },

    /// The stream ended in the middle of a message.
    #[error("stream closed mid-message")]
    TruncatedMessage,

    /// The body is not valid JSON.
    #[error("body is not valid JSON: {reason}")]
    MalformedJson {
        /// Parser diagnostic.
        reason: String,
    },

    /// The `jsonrpc` field is absent.
    #[error("missing required jsonrpc field")]
    MissingVersion,

    /// The `jsonrpc` field is present but not `"2.0"`.
    #[error("unsupported JSON-RPC version: {version}")]
    UnsupportedVersion {
        /// The version string found in the message.
        version: String,
    },

    /// An underlying IO error while reading or writing the stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-level proxy failures. Each maps to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A server subprocess failed to start.
    #[error("failed to spawn server {name}: {reason}")]
    Spawn {
        /// Positional server name.
        name: String,
        /// Human-readable description of the spawn failure.
        reason: String,
    },

    /// A framing error on one of the transports.
    #[error("framing error on {endpoint:?} stream: {source}")]
    Framing {
        /// Which endpoint the error occurred on.
        endpoint: Source,
        /// The underlying framing error.
        source: FramingError,
    },

    /// A server died or timed out before completing `initialize`.
    #[error("server {name} failed during initialization")]
    InitializeFailed {
        /// Name of the failing server.
        name: String,
    },

    /// A server exited outside of the shutdown sequence.
    #[error("server {name} exited unexpectedly")]
    ServerDied {
        /// Name of the failing server.
        name: String,
    },

    /// An underlying IO error outside the framed transports.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
