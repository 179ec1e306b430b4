//! # ember-http
//!
//! HTTP/1.1 per-connection layer: everything between "bytes arrived on a
//! socket" and "bytes ready to go back out". No reactor or threading
//! policy lives here; the server crate decides when each step runs.
//!
//! ## Modules
//!
//! - `buffer` - Read buffer, two-span pending write, read/write drains
//! - `request` - Incremental request parser and form handling
//! - `response` - Status resolution, MIME table, response serialization
//! - `mapped` - Read-only mmap of a response body
//! - `credentials` - Login/registration store
//! - `session` - Per-connection state machine shared with worker tasks

pub mod buffer;
pub mod request;
pub mod response;
pub mod mapped;
pub mod credentials;
pub mod session;

// Re-exports for convenience
pub use buffer::{Body, PendingWrite, ReadBuffer, ReadOutcome, WriteOutcome};
pub use credentials::{CredentialStore, MemoryStore};
pub use mapped::MappedFile;
pub use request::{Method, ParseState, Request, RequestParser};
pub use response::Response;
pub use session::{NextStep, ProcessContext, Session};
