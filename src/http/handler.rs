//! Request interpreter: applies a request to the storage backend.

use super::parser::{self, Method, QueryPair, Request};
use super::response::Response;
use crate::storage::{Storage, StorageResult};
use bytes::BytesMut;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

/// A storage operation applied to one query pair
type Operation = fn(&Storage, QueryPair) -> StorageResult;

fn read(storage: &Storage, pair: QueryPair) -> StorageResult {
    storage.get(&pair.key)
}

fn write(storage: &Storage, pair: QueryPair) -> StorageResult {
    // A bare `key` token on POST stores null
    let value = pair.value.map_or(Value::Null, Value::String);
    storage.set(&pair.key, value)
}

fn remove(storage: &Storage, pair: QueryPair) -> StorageResult {
    storage.delete(&pair.key)
}

/// Method dispatch table
fn operation(method: Method) -> Operation {
    match method {
        Method::Get => read,
        Method::Post => write,
        Method::Delete => remove,
    }
}

/// Apply every query pair of `request`, in order, and fold the results.
///
/// Later entries overwrite earlier ones with the same key, so `a=1&a=2`
/// reports (and stores) `2`. An empty query yields an empty mapping.
pub fn execute(request: &Request<'_>, storage: &Storage) -> Map<String, Value> {
    let apply = operation(request.method);
    let mut result = Map::new();

    for pair in parser::parse_query(request.query) {
        trace!(method = request.method.as_str(), key = %pair.key, "Applying query pair");
        let (key, value) = apply(storage, pair).into_entry();
        result.insert(key, value);
    }

    result
}

/// Turn one raw request into a complete response.
///
/// Request errors are answered with a 400 response; they never propagate.
pub fn process(input: &[u8], storage: &Storage, limit: usize) -> BytesMut {
    match parser::parse(input, limit) {
        Ok(request) => {
            debug!(method = request.method.as_str(), path = request.path, "Handling request");
            Response::json(&execute(&request, storage))
        }
        Err(e) => {
            warn!(error = %e, "Rejecting request");
            Response::bad_request(e.kind(), &e.to_string())
        }
    }
}
