//! HTTP response generation.
//!
//! Every response is a complete `HTTP/1.1` message with a JSON body and an
//! exact `Content-Length`; there is no chunked or close-delimited framing.

use bytes::BytesMut;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use std::io;
use tracing::error;

/// Body sent when a result mapping cannot be serialized
const INTERNAL_ERROR_BODY: &[u8] = br#"{"error": "InternalError"}"#;

/// Response status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// JSON formatter writing `": "` after keys and `", "` between elements,
/// so bodies read `{"a": "4", "b": "5"}`.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Serialize a mapping in insertion order
pub fn json_body(map: &Map<String, Value>) -> serde_json::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(64);
    let mut serializer = serde_json::Serializer::with_formatter(&mut body, SpacedFormatter);
    map.serialize(&mut serializer)?;
    Ok(body)
}

/// Response builders
pub struct Response;

impl Response {
    /// Generate a 200 response carrying the result mapping
    pub fn json(map: &Map<String, Value>) -> BytesMut {
        Self::render(Status::Ok, map)
    }

    /// Generate a 400 response describing a rejected request
    pub fn bad_request(kind: &str, message: &str) -> BytesMut {
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(kind.to_string()));
        map.insert("message".to_string(), Value::String(message.to_string()));
        Self::render(Status::BadRequest, &map)
    }

    fn render(status: Status, map: &Map<String, Value>) -> BytesMut {
        match json_body(map) {
            Ok(body) => Self::frame(status, &body),
            Err(e) => {
                error!(error = %e, "Failed to serialize response body");
                Self::frame(Status::InternalServerError, INTERNAL_ERROR_BODY)
            }
        }
    }

    /// Wrap a body in a status line and headers
    pub fn frame(status: Status, body: &[u8]) -> BytesMut {
        let header = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status.code(),
            status.reason(),
            body.len()
        );

        let mut response = BytesMut::with_capacity(header.len() + body.len());
        response.extend_from_slice(header.as_bytes());
        response.extend_from_slice(body);
        response
    }
}
