//! Request line and query string parser.

use std::str;

/// Methods the store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    /// Match a method token, ignoring ASCII case
    pub fn from_token(token: &str) -> Option<Method> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else if token.eq_ignore_ascii_case("DELETE") {
            Some(Method::Delete)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// A parsed request line, borrowing from the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    /// Everything after the first `?` in the path, empty if there is none
    pub query: &'a str,
}

/// A decoded `key[=value]` token from a query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPair {
    pub key: String,
    pub value: Option<String>,
}

/// Request parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The request line is not `METHOD PATH ...`
    #[error("malformed request line: {0}")]
    MalformedRequest(String),
    /// The method is not GET, POST or DELETE
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// The read filled the buffer without reaching the end of the request line
    #[error("request line exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },
}

impl RequestError {
    /// Stable name reported in error response bodies
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::MalformedRequest(_) => "MalformedRequest",
            RequestError::UnknownMethod(_) => "UnknownMethod",
            RequestError::RequestTooLarge { .. } => "RequestTooLarge",
        }
    }
}

/// Parse the request line from `input`.
///
/// Grammar: `METHOD SP PATH [SP VERSION] LF`, where whitespace runs of any
/// length separate tokens and a trailing `\r` is ignored. The line ends at the
/// first `\n`, or at the end of the input when no newline was read. `limit` is
/// the read buffer size: an input that filled it without a newline was cut off
/// mid-line and is rejected rather than silently truncated.
pub fn parse(input: &[u8], limit: usize) -> Result<Request<'_>, RequestError> {
    let line = match input.iter().position(|&b| b == b'\n') {
        Some(end) => &input[..end],
        None if input.len() >= limit => return Err(RequestError::RequestTooLarge { limit }),
        None => input,
    };

    let line = str::from_utf8(line).map_err(|_| {
        RequestError::MalformedRequest("invalid UTF-8 in request line".to_string())
    })?;

    let mut parts = line.split_ascii_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => {
            return Err(RequestError::MalformedRequest(
                "expected a method and a path".to_string(),
            ))
        }
    };

    let method = Method::from_token(method)
        .ok_or_else(|| RequestError::UnknownMethod(method.to_ascii_uppercase()))?;

    let query = path.split_once('?').map_or("", |(_, query)| query);

    Ok(Request {
        method,
        path,
        query,
    })
}

/// Decode a query string such as `a=1&b&c=3` into ordered pairs.
///
/// Each token is split on its first `=` only, so `k=a=b` yields the value
/// `a=b`. Tokens without `=` carry no value. Tokens with an empty key (`&&`,
/// a trailing `&`, or `=v`) are skipped. Keys and values are taken verbatim.
pub fn parse_query(query: &str) -> Vec<QueryPair> {
    query
        .split('&')
        .filter_map(|token| {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (token, None),
            };
            if key.is_empty() {
                return None;
            }
            Some(QueryPair {
                key: key.to_string(),
                value,
            })
        })
        .collect()
}
