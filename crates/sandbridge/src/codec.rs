//! Language Server Protocol base framing.
//!
//! A message is a block of `Name: value` header lines, each ending in
//! `\r\n`, an empty line, then a JSON body whose length in bytes is given by
//! the `Content-Length` header. Other headers are accepted and ignored.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Largest body accepted by the decoder.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Frames `serde_json::Value` messages with `Content-Length` headers.
#[derive(Debug, Default)]
pub struct LspCodec {
    // Body length of the message whose headers were already consumed.
    pending: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_headers(block: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(block).map_err(|_| invalid("header is not valid UTF-8"))?;
    let mut length = None;

    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed header line {line:?}")))?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            let parsed = value
                .parse::<usize>()
                .map_err(|_| invalid(format!("invalid Content-Length {value:?}")))?;
            length = Some(parsed);
        }
    }

    let length = length.ok_or_else(|| invalid("missing Content-Length header"))?;
    if length > MAX_BODY_BYTES {
        return Err(invalid(format!(
            "message body of {length} bytes exceeds the {MAX_BODY_BYTES} byte limit"
        )));
    }
    Ok(length)
}

impl Decoder for LspCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Value>> {
        let length = match self.pending {
            Some(length) => length,
            None => {
                let Some(end) = src.windows(HEADER_END.len()).position(|w| w == HEADER_END)
                else {
                    return Ok(None);
                };
                let length = parse_headers(&src[..end])?;
                src.advance(end + HEADER_END.len());
                self.pending = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        let body = src.split_to(length);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| invalid(format!("message body is not JSON: {e}")))
    }
}

impl Encoder<Value> for LspCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> io::Result<()> {
        let body = serde_json::to_vec(&item).map_err(io::Error::other)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
