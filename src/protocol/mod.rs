//! OML measurement protocol ingestion.
//!
//! This module turns the line-oriented text protocol spoken by OML clients into
//! typed tuple streams that can feed tables.
//!
//! # Overview
//!
//! An [`Endpoint`] accepts TCP connections and runs one [`Session`] per
//! connection on its own thread. A session first reads a header block of
//! `key: value` lines terminated by a blank line. Within that block,
//! `schema:` lines declare streams:
//!
//! ```text
//! schema: <index> <stream-name> <col>:<type> <col>:<type> ...
//! ```
//!
//! Every declared schema is prefixed with three internal columns, `oml_ts`,
//! `sender_id` and `oml_seq_no`. After the header, each tab-separated line is a
//! data row `ts, index, seq_no, values...` for the stream at the 1-based
//! `index`; the index field is replaced by the sender id from the header before
//! the row is handed to the stream. Rows with index `0` are meta rows; a
//! `./schema` meta row declares or re-declares a stream mid-session.
//!
//! # Key Components
//!
//! - [`Endpoint`]: TCP listener, stoppable through an [`EndpointHandle`].
//! - [`Session`]: Per-connection protocol state machine.
//! - [`StreamEvents`]: Observers notified when a client declares a stream.
//! - [`Stream`] / [`Tuple`]: Typed stream and lazily cast measurement record.
//!
//! # See Also
//!
//! - [`storage`](crate::storage): Tables that streams feed into.
pub mod events;
pub mod server;
pub mod session;
pub mod tuple;

pub use events::{StreamEvents, StreamObserver};
pub use server::{Endpoint, EndpointError, EndpointHandle};
pub use session::{SENDER_ID_HEADER, Session, SessionError, SessionState};
pub use tuple::{SENDER_COLUMN, SEQ_NO_COLUMN, Stream, TS_COLUMN, Tuple, TupleObserver};
