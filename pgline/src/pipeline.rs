//! Command queue and in-flight command bookkeeping.
//!
//! Commands run strictly one at a time over the wire. The queue keeps them in
//! enqueue order until the state machine is idle, then the head is popped and
//! becomes the single in-flight command until `ReadyForQuery` resolves it.
use std::fmt;

use bytes::Bytes;

use crate::{
    Error, Result,
    error::ConnectionClosed,
    row::{FieldDescriptor, Row},
};

/// Terminal callback of a [`Command`].
pub type Callback = Box<dyn FnOnce(Result<Response>) + Send>;

/// Per row callback, presence of a sink switches the command to streaming mode.
pub type RowSink = Box<dyn FnMut(Row) + Send>;

/// Successful outcome of a command.
#[derive(Debug, Default)]
pub struct Response {
    /// Buffered rows, always empty in streaming mode.
    pub rows: Vec<Row>,
    /// Rows affected as reported by the command tag.
    pub rows_affected: u64,
}

/// Longest sql text that still fits a `Query` frame.
const MAX_SQL_LEN: usize = i32::MAX as usize - 5;

/// Sql text that cannot be carried by a `Query` message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum InvalidSql {
    /// Nul byte at the given offset, the wire format is nul terminated.
    Nul(usize),
    /// Sql length exceeds a single frame.
    TooLong(usize),
}

impl std::error::Error for InvalidSql { }

impl fmt::Display for InvalidSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nul(offset) => write!(f, "sql contains nul byte at offset {offset}"),
            Self::TooLong(len) => write!(f, "sql too long for a single message: {len} bytes"),
        }
    }
}

impl fmt::Debug for InvalidSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A single sql command and where its result goes.
pub struct Command {
    sql: String,
    callback: Callback,
    sink: Option<RowSink>,
}

impl Command {
    pub fn new(sql: impl Into<String>, callback: impl FnOnce(Result<Response>) + Send + 'static) -> Self {
        Self { sql: sql.into(), callback: Box::new(callback), sink: None }
    }

    /// Stream each row to `sink` instead of buffering.
    pub fn with_sink(mut self, sink: impl FnMut(Row) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    /// Check the sql can be sent as a simple query.
    pub fn check(&self) -> Result<(), InvalidSql> {
        if self.sql.len() > MAX_SQL_LEN {
            return Err(InvalidSql::TooLong(self.sql.len()));
        }
        match self.sql.bytes().position(|b| b == 0) {
            Some(offset) => Err(InvalidSql::Nul(offset)),
            None => Ok(()),
        }
    }

    /// Resolve with `error` without running.
    pub(crate) fn fail(self, error: Error) {
        (self.callback)(Err(error))
    }

    /// Resolve without running, used when the connection is gone.
    pub(crate) fn reject(self) {
        self.fail(ConnectionClosed.into())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("sql", &self.sql)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

/// FIFO of pending commands.
///
/// Popped entries are only marked empty, the dead prefix is drained once it
/// grows past half of the storage. Physically retained entries therefore never
/// exceed twice the pending ones.
#[derive(Default)]
pub struct CommandQueue {
    entries: Vec<Option<Command>>,
    head: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: Command) {
        self.entries.push(Some(command));
    }

    pub fn pop_front(&mut self) -> Option<Command> {
        let command = self.entries.get_mut(self.head)?.take();
        self.head += 1;

        if self.head * 2 > self.entries.len() {
            self.entries.drain(..self.head);
            self.head = 0;
        }

        command
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.entries.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of physically retained entries, including already popped ones.
    pub fn retained(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.len())
            .field("retained", &self.retained())
            .finish()
    }
}

/// The command currently on the wire.
pub(crate) struct InFlight {
    command: Command,
    fields: Vec<FieldDescriptor>,
    rows: Vec<Row>,
    rows_affected: u64,
    error: Option<Error>,
}

impl InFlight {
    pub(crate) fn new(command: Command) -> Self {
        Self { command, fields: vec![], rows: vec![], rows_affected: 0, error: None }
    }

    /// New result set, replaces previous field metadata.
    pub(crate) fn describe(&mut self, fields: Vec<FieldDescriptor>) {
        self.fields = fields;
    }

    pub(crate) fn data_row(&mut self, values: Vec<Option<Bytes>>) {
        if self.error.is_some() {
            return;
        }

        match Row::assemble(&self.fields, values) {
            Ok(row) => match &mut self.command.sink {
                Some(sink) => sink(row),
                None => self.rows.push(row),
            },
            Err(err) => self.error = Some(err.into()),
        }
    }

    pub(crate) fn complete(&mut self, rows_affected: u64) {
        self.rows_affected += rows_affected;
    }

    /// Record an error, only the first one in a cycle is kept.
    pub(crate) fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn resolve(self) {
        let result = match self.error {
            Some(err) => Err(err),
            None => Ok(Response { rows: self.rows, rows_affected: self.rows_affected }),
        };
        (self.command.callback)(result)
    }

    pub(crate) fn reject(self) {
        self.command.reject();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn noop(sql: &str) -> Command {
        Command::new(sql, |_| {})
    }

    #[test]
    fn fifo_order() {
        let mut queue = CommandQueue::new();
        for sql in ["a", "b", "c"] {
            queue.enqueue(noop(sql));
        }
        let order = std::iter::from_fn(|| queue.pop_front()).map(|c| c.sql).collect::<Vec<_>>();
        assert_eq!(order, ["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.retained(), 0);
    }

    #[test]
    fn retained_bounded_by_pending() {
        let mut queue = CommandQueue::new();
        let mut n = 0usize;
        // interleave bursts of enqueue with partial drains
        for round in 0..64 {
            for _ in 0..(round % 7 + 1) {
                queue.enqueue(noop(&n.to_string()));
                n += 1;
                assert!(queue.retained() <= 2 * queue.len());
            }
            for _ in 0..(round % 5 + 1) {
                queue.pop_front();
                assert!(queue.retained() <= 2 * queue.len(), "{queue:?}");
            }
        }
        while queue.pop_front().is_some() {
            assert!(queue.retained() <= 2 * queue.len(), "{queue:?}");
        }
        assert_eq!(queue.retained(), 0);
    }

    #[test]
    fn first_error_wins() {
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let mut flight = InFlight::new(Command::new("x", move |r| {
            *out2.lock().unwrap() = Some(r.map(|_| ()).map_err(|e| e.is_closed()));
        }));
        flight.fail(ConnectionClosed.into());
        flight.fail(crate::postgres::ProtocolError::UnknownAuth(99).into());
        flight.resolve();
        assert_eq!(*out.lock().unwrap(), Some(Err(true)));
    }

    #[test]
    fn check_sql() {
        assert_eq!(noop("SELECT 1").check(), Ok(()));
        assert_eq!(noop("").check(), Ok(()));
        assert_eq!(noop("\0").check(), Err(InvalidSql::Nul(0)));
        assert_eq!(noop("SELECT 'a\0b'").check(), Err(InvalidSql::Nul(9)));
    }
}
