//! Minimal HTTP surface over the key-value store.
//!
//! Only the request line is interpreted:
//!
//! ```text
//! POST   /?a=4&b=5   -> {"a": "4", "b": "5"}
//! GET    /?a         -> {"a": "4"}   or {"KeyNotFound": "InvalidOperation"}
//! DELETE /?a         -> {"a": "4"}   or {"KeyNotFound": "InvalidOperation"}
//! ```
//!
//! Headers and bodies are ignored, and every response closes the connection.

pub mod handler;
pub mod parser;
pub mod response;

pub use handler::process;
