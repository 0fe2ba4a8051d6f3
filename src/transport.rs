//! Length-prefixed JSON-RPC framing over byte streams.
//!
//! The wire format is the LSP stdio framing: an HTTP-style header block
//! (`Content-Length: N\r\n`, optionally `Content-Type: ...\r\n`, terminated
//! by an empty `\r\n` line) followed by exactly N bytes of UTF-8 JSON.
//!
//! The reader validates the `jsonrpc` version here, at the framing layer;
//! classification into request/response/notification happens one level up in
//! [`crate::jsonrpc`].

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::FramingError;

/// Upper bound on a single message body. Bodies beyond this are treated as a
/// framing error rather than an allocation request.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Reads framed JSON-RPC messages from an async byte stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a raw reader.
    pub fn new(reader: R) -> MessageReader<R> {
        MessageReader {
            inner: BufReader::new(reader),
            line: Vec::with_capacity(128),
        }
    }

    /// Read one framed message body as parsed JSON.
    ///
    /// Returns `Ok(None)` on clean EOF (stream closed between messages).
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] on malformed headers, a missing
    /// `Content-Length`, a truncated body, a non-JSON body, or a `jsonrpc`
    /// field that is absent or not `"2.0"`.
    pub async fn read_message(&mut self) -> Result<Option<Value>, FramingError> {
        let mut content_length: Option<usize> = None;
        let mut first_line = true;

        // Header block: lines until the empty separator line.
        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None if first_line && content_length.is_none() => return Ok(None),
                None => return Err(FramingError::TruncatedMessage),
            };
            first_line = false;

            if line.is_empty() {
                break;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(FramingError::MalformedHeader { line });
            };
            // Header names are case-insensitive; values are trimmed. Unknown
            // headers (Content-Type among them) are ignored.
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                let length: usize =
                    value
                        .parse()
                        .map_err(|_| FramingError::InvalidContentLength {
                            value: value.to_string(),
                        })?;
                if length > MAX_MESSAGE_BYTES {
                    return Err(FramingError::InvalidContentLength {
                        value: value.to_string(),
                    });
                }
                content_length = Some(length);
            }
        }

        let length = content_length.ok_or(FramingError::MissingContentLength)?;

        let mut body = vec![0u8; length];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FramingError::TruncatedMessage,
                _ => FramingError::Io(e),
            })?;

        let value: Value =
            serde_json::from_slice(&body).map_err(|e| FramingError::MalformedJson {
                reason: e.to_string(),
            })?;

        match value.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => Ok(Some(value)),
            Some(version) => Err(FramingError::UnsupportedVersion {
                version: version.to_string(),
            }),
            None => Err(FramingError::MissingVersion),
        }
    }

    /// Read one `\r\n`-terminated header line, without the terminator.
    /// Returns `None` on EOF before any byte of the line.
    async fn read_line(&mut self) -> Result<Option<String>, FramingError> {
        self.line.clear();
        loop {
            let byte = match self.inner.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if self.line.is_empty() {
                        return Ok(None);
                    }
                    return Err(FramingError::TruncatedMessage);
                }
                Err(e) => return Err(FramingError::Io(e)),
            };
            if byte == b'\n' {
                // Tolerate a bare \n terminator; strip the \r when present.
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                let line = String::from_utf8(std::mem::take(&mut self.line)).map_err(|e| {
                    FramingError::MalformedHeader {
                        line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    }
                })?;
                return Ok(Some(line));
            }
            if self.line.len() > 4096 {
                return Err(FramingError::MalformedHeader {
                    line: String::from_utf8_lossy(&self.line).into_owned(),
                });
            }
            self.line.push(byte);
        }
    }
}

/// Writes framed JSON-RPC messages to an async byte stream.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a raw writer.
    pub fn new(writer: W) -> MessageWriter<W> {
        MessageWriter { inner: writer }
    }

    /// Serialize and frame one message. `Content-Length` is the UTF-8 byte
    /// count of the body; no trailing newline is emitted.
    pub async fn write_message(&mut self, value: &Value) -> Result<(), FramingError> {
        let body = serde_json::to_vec(value).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream.
    pub async fn close(&mut self) -> Result<(), FramingError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn read_all(input: &[u8]) -> Result<Option<Value>, FramingError> {
        MessageReader::new(input).read_message().await
    }

    #[tokio::test]
    async fn reads_simple_frame() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"shutdown"}"#;
        let framed = [
            format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes(),
            body.to_vec(),
        ]
        .concat();
        let value = read_all(&framed).await.unwrap().unwrap();
        assert_eq!(value["method"], "shutdown");
    }

    #[tokio::test]
    async fn header_names_case_insensitive_values_trimmed() {
        let body = br#"{"jsonrpc":"2.0","method":"initialized"}"#;
        let framed = [
            format!(
                "content-LENGTH:   {}  \r\nContent-Type: application/vscode-jsonrpc\r\n\r\n",
                body.len()
            )
            .into_bytes(),
            body.to_vec(),
        ]
        .concat();
        let value = read_all(&framed).await.unwrap().unwrap();
        assert_eq!(value["method"], "initialized");
    }

    #[tokio::test]
    async fn eof_between_messages_is_clean() {
        assert!(read_all(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_truncation() {
        let err = read_all(b"Content-Length: 10\r\n").await.unwrap_err();
        assert!(matches!(err, FramingError::TruncatedMessage));
    }

    #[tokio::test]
    async fn eof_mid_body_is_truncation() {
        let err = read_all(b"Content-Length: 100\r\n\r\n{\"jsonrpc\"")
            .await
            .unwrap_err();
        assert!(matches!(err, FramingError::TruncatedMessage));
    }

    #[tokio::test]
    async fn missing_content_length_rejected() {
        let err = read_all(b"Content-Type: application/json\r\n\r\n{}")
            .await
            .unwrap_err();
        assert!(matches!(err, FramingError::MissingContentLength));
    }

    #[tokio::test]
    async fn garbage_header_rejected() {
        let err = read_all(b"not a header\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, FramingError::MalformedHeader { .. }));
    }

    #[tokio::test]
    async fn non_numeric_length_rejected() {
        let err = read_all(b"Content-Length: ten\r\n\r\n").await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::InvalidContentLength { ref value } if value == "ten"
        ));
    }

    #[tokio::test]
    async fn non_json_body_rejected() {
        let err = read_all(b"Content-Length: 5\r\n\r\nhello").await.unwrap_err();
        assert!(matches!(err, FramingError::MalformedJson { .. }));
    }

    #[tokio::test]
    async fn wrong_version_rejected() {
        let body = br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#;
        let framed = [
            format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes(),
            body.to_vec(),
        ]
        .concat();
        let err = read_all(&framed).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::UnsupportedVersion { ref version } if version == "1.0"
        ));
    }

    #[tokio::test]
    async fn missing_version_rejected() {
        let body = br#"{"id":1,"method":"x"}"#;
        let framed = [
            format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes(),
            body.to_vec(),
        ]
        .concat();
        let err = read_all(&framed).await.unwrap_err();
        assert!(matches!(err, FramingError::MissingVersion));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut buf = Vec::new();
        let value = json!({"jsonrpc": "2.0", "id": 42, "result": {"ok": true}});
        MessageWriter::new(std::io::Cursor::new(&mut buf))
            .write_message(&value)
            .await
            .unwrap();

        // Content-Length matches the body byte count exactly.
        let text = String::from_utf8(buf.clone()).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = header
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
        assert!(!body.ends_with('\n'));

        let back = read_all(&buf).await.unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn content_length_counts_utf8_bytes() {
        let mut buf = Vec::new();
        let value = json!({"jsonrpc": "2.0", "method": "window/showMessage",
                           "params": {"message": "héllo — ünïcode"}});
        MessageWriter::new(std::io::Cursor::new(&mut buf))
            .write_message(&value)
            .await
            .unwrap();
        let back = read_all(&buf).await.unwrap().unwrap();
        assert_eq!(back["params"]["message"], "héllo — ünïcode");
    }

    #[tokio::test]
    async fn reads_two_frames_in_sequence() {
        let mut buf = Vec::new();
        let first = json!({"jsonrpc": "2.0", "id": 1, "method": "a"});
        let second = json!({"jsonrpc": "2.0", "id": 2, "method": "b"});
        {
            let mut writer = MessageWriter::new(std::io::Cursor::new(&mut buf));
            writer.write_message(&first).await.unwrap();
            writer.write_message(&second).await.unwrap();
        }
        let mut reader = MessageReader::new(buf.as_slice());
        assert_eq!(reader.read_message().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_message().await.unwrap().unwrap(), second);
        assert!(reader.read_message().await.unwrap().is_none());
    }
}
