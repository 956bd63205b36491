//! Per-connection OML protocol state machine.
//!
//! A session reads newline-delimited text. It starts in
//! [`SessionState::AwaitingHeader`], where every line is either a
//! `key: value` header field, a `schema: <index> <name> <col:type>...`
//! declaration, or the blank line that ends the header. In
//! [`SessionState::AwaitingRows`] every line is a tab-separated data row whose
//! second field is the 1-based stream index; index `0` marks a meta row.
//! End of input moves the session to [`SessionState::Closed`].
//!
//! Malformed rows, rows for undeclared streams and unknown meta keys are
//! logged and discarded; only I/O failures end a session early.
use std::{
    collections::HashMap,
    io::{self, BufRead},
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use super::{
    events::StreamEvents,
    tuple::{SENDER_COLUMN, SEQ_NO_COLUMN, Stream, TS_COLUMN},
};
use crate::storage::{ColumnSpec, Schema};

/// Header key carrying the sender id spliced into every row.
pub const SENDER_ID_HEADER: &str = "sender-id";

const UNKNOWN_SENDER: &str = "unknown";
const SCHEMA_META_KEY: &str = "./schema";
const META_ROW_WIDTH: usize = 5;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeader,
    AwaitingRows,
    Closed,
}

pub struct Session {
    peer: String,
    events: StreamEvents,
    header: HashMap<String, String>,
    streams: HashMap<usize, Stream>,
    state: SessionState,
    discarded: u64,
}

impl Session {
    pub fn new(events: StreamEvents, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            events,
            header: HashMap::new(),
            streams: HashMap::new(),
            state: SessionState::AwaitingHeader,
            discarded: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn sender_id(&self) -> &str {
        self.header(SENDER_ID_HEADER).unwrap_or(UNKNOWN_SENDER)
    }

    /// Stream declared at the 0-based `index`.
    pub fn stream(&self, index: usize) -> Option<&Stream> {
        self.streams.get(&index)
    }

    /// Number of lines dropped as malformed or unroutable.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Processes lines from `reader` until end of input.
    pub fn run<R: BufRead>(&mut self, mut reader: R) -> Result<(), SessionError> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = match reader.read_until(b'\n', &mut buf) {
                Ok(read) => read,
                Err(e) => {
                    self.state = SessionState::Closed;
                    return Err(e.into());
                }
            };
            if read == 0 {
                debug!("[{}] end of stream", self.peer);
                self.state = SessionState::Closed;
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            self.process_line(&line);
        }
    }

    pub fn process_line(&mut self, line: &str) {
        trace!("[{}] {:?} <- {line:?}", self.peer, self.state);
        match self.state {
            SessionState::AwaitingHeader => self.parse_header_line(line.trim()),
            SessionState::AwaitingRows => self.parse_row(line.trim_end_matches(['\n', '\r'])),
            SessionState::Closed => {
                warn!("[{}] line after close ignored", self.peer);
                self.discarded += 1;
            }
        }
    }

    fn parse_header_line(&mut self, line: &str) {
        if line.is_empty() {
            debug!("[{}] header complete, sender '{}'", self.peer, self.sender_id());
            self.state = SessionState::AwaitingRows;
            return;
        }

        let Some((key, value)) = line.split_once(':') else {
            warn!("[{}] malformed header line '{line}'", self.peer);
            self.discarded += 1;
            return;
        };
        let key = key.trim();
        if key == "schema" {
            self.declare_schema(value);
        } else {
            debug!("[{}] header {key}: {}", self.peer, value.trim());
            self.header.insert(key.to_string(), value.trim().to_string());
        }
    }

    fn declare_schema(&mut self, descriptor: &str) {
        let mut parts = descriptor.split_whitespace();
        let index = parts
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|index| *index > 0);
        let (Some(index), Some(name)) = (index, parts.next()) else {
            warn!("[{}] malformed schema declaration '{}'", self.peer, descriptor.trim());
            self.discarded += 1;
            return;
        };

        let mut specs = vec![
            ColumnSpec::typed(TS_COLUMN, "double"),
            ColumnSpec::typed(SENDER_COLUMN, "string"),
            ColumnSpec::typed(SEQ_NO_COLUMN, "integer"),
        ];
        for column in parts {
            let spec = match column.split_once(':') {
                // blobs travel base64 encoded
                Some((col, t)) if t.eq_ignore_ascii_case("blob") => ColumnSpec::typed(col, "blob64"),
                Some((col, t)) => ColumnSpec::typed(col, t),
                None => ColumnSpec::from(column),
            };
            specs.push(spec);
        }

        let schema = match Schema::parse(specs) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("[{}] rejected schema for stream '{name}': {e}", self.peer);
                self.discarded += 1;
                return;
            }
        };

        let slot = index - 1;
        let stream = Stream::new(name, slot, schema);
        if self.streams.insert(slot, stream.clone()).is_some() {
            info!("[{}] stream {index} re-declared as '{name}'", self.peer);
        } else {
            info!("[{}] new stream {index} '{name}'", self.peer);
        }
        self.events.report(name, &stream);
    }

    fn parse_row(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let mut fields: Vec<String> = line.split('\t').map(str::to_string).collect();
        let index = match fields.get(1).map(|f| f.trim().parse::<usize>()) {
            Some(Ok(index)) => index,
            _ => {
                warn!("[{}] row without stream index discarded: '{line}'", self.peer);
                self.discarded += 1;
                return;
            }
        };
        if index == 0 {
            self.parse_meta_row(&fields);
            return;
        }

        let Some(stream) = self.stream(index - 1).cloned() else {
            warn!("[{}] row for undeclared stream {index} discarded", self.peer);
            self.discarded += 1;
            return;
        };
        fields[1] = self.sender_id().to_string();
        stream.parse_tuple(fields);
    }

    fn parse_meta_row(&mut self, fields: &[String]) {
        if fields.len() != META_ROW_WIDTH {
            warn!(
                "[{}] meta row with {} fields discarded (expected {META_ROW_WIDTH})",
                self.peer,
                fields.len()
            );
            self.discarded += 1;
            return;
        }

        let key = format!("{}/{}", fields[2], fields[3]).to_lowercase();
        if key == SCHEMA_META_KEY {
            self.declare_schema(&fields[4]);
        } else {
            info!("[{}] unrecognized meta key '{key}' discarded", self.peer);
            self.discarded += 1;
        }
    }
}
