//! Connection level protocol state machine.
//!
//! [`Machine`] owns no I/O. The driver feeds it transport [`Event`]s through
//! [`Machine::dispatch`], writes whatever [`Machine::take_output`] returns, and
//! forwards [`Notification`]s to subscribers.
//!
//! ```text
//! Connecting -> Authenticating -> Idle <-> Busy
//!                                  |
//!                                  v
//!                              Closing -> Closed
//! ```
//!
//! Any fatal failure moves straight to `Closed`, failing every pending command.
use bytes::{Bytes, BytesMut};
use std::{collections::VecDeque, fmt, io, sync::Arc};

use crate::{
    Error,
    common::{ByteStr, debug, error, info, span, trace, verbose, warning},
    connection::{Config, Verbosity},
    error::UnsupportedCopy,
    ext::FmtExt,
    pipeline::{Command, CommandQueue, InFlight},
    postgres::{
        BackendMessage, ErrorResponse, FrontendProtocol, NoticeResponse, ProtocolError,
        backend::{Authentication, BackendKeyData, ReadyForQuery, TransactionStatus},
        codec::{Frame, split_frame},
        frontend::{self, CopyFail, PasswordMessage, Query, Startup, Terminate},
    },
};

mod auth;

pub use auth::{UnsupportedAuth, md5_password};

/// Connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for the transport.
    Connecting,
    /// Startup sent, exchanging credentials until the first `ReadyForQuery`.
    Authenticating,
    Idle,
    /// A command is in flight.
    Busy,
    /// `Terminate` sent, waiting for the transport to end.
    Closing,
    Closed,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Idle => "Idle",
            Self::Busy => "Busy",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

/// Transport event.
#[derive(Debug)]
pub enum Event<'a> {
    /// Transport is connected.
    Connected,
    /// Bytes received, not necessarily frame aligned.
    Data(&'a [u8]),
    /// Transport reached end of stream.
    End,
    /// Transport failed.
    Error(io::Error),
}

/// Connection level signal.
#[derive(Clone, Debug)]
pub enum Notification {
    /// Handshake completed, sent once.
    Connected {
        backend_key: Option<BackendKeyData>,
    },
    /// Server reported a run-time parameter.
    ParameterStatus {
        name: ByteStr,
        value: ByteStr,
    },
    Notice(NoticeResponse),
    /// Server error or fatal connection failure.
    Error(Arc<Error>),
    /// Connection is closed, sent once and always last.
    Closed,
}

/// Protocol state machine of a single connection.
pub struct Machine {
    config: Config,
    state: State,
    closing: bool,

    queue: CommandQueue,
    in_flight: Option<InFlight>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    notifications: VecDeque<Notification>,

    transaction: TransactionStatus,
    params: Vec<(ByteStr, ByteStr)>,
    backend_key: Option<BackendKeyData>,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: State::Connecting,
            closing: false,
            queue: CommandQueue::new(),
            in_flight: None,
            read_buf: BytesMut::with_capacity(1024),
            write_buf: BytesMut::with_capacity(1024),
            notifications: VecDeque::new(),
            transaction: TransactionStatus::Idle,
            params: vec![],
            backend_key: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction
    }

    /// Latest value of a run-time parameter reported by the server.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    /// Number of commands not yet resolved, including the in-flight one.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.in_flight.is_some() as usize
    }

    /// Returns `true` when the transport should be shut down after flushing output.
    pub fn wants_shutdown(&self) -> bool {
        matches!(self.state, State::Closing | State::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Take bytes that need to be written to the transport.
    pub fn take_output(&mut self) -> Option<Bytes> {
        if self.write_buf.is_empty() {
            return None;
        }
        Some(self.write_buf.split().freeze())
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Queue a command, it is sent right away when the connection is idle.
    ///
    /// Rejected with [`ConnectionClosed`][crate::error::ConnectionClosed] once close is requested.
    pub fn enqueue(&mut self, command: Command) {
        if self.closing || self.state == State::Closed {
            debug!("rejected command after close: {:?}", command.sql());
            command.reject();
            return;
        }
        self.queue.enqueue(command);
        self.drive();
    }

    /// Close gracefully once every queued command is resolved.
    pub fn request_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        match self.state {
            State::Connecting if self.queue.is_empty() => self.closed(),
            State::Idle => self.drive(),
            _ => {}
        }
    }

    /// Single entry point of every transport event.
    pub fn dispatch(&mut self, event: Event<'_>) {
        span!("dispatch", state = self.state.name());
        match event {
            Event::Connected => {
                if self.state != State::Connecting {
                    warning!("connected event in {} state", self.state.name());
                    return;
                }
                self.startup();
            }
            Event::Data(data) => {
                if self.state == State::Closed {
                    return;
                }
                if self.config.verbosity >= Verbosity::Bytes {
                    debug!("<- {}", data.lossy());
                }
                self.read_buf.extend_from_slice(data);
                self.read_frames();
            }
            Event::End => match self.state {
                State::Closed => {}
                State::Closing => self.closed(),
                _ => self.fail(
                    io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection").into(),
                ),
            },
            Event::Error(err) => {
                if self.state != State::Closed {
                    self.fail(err.into());
                }
            }
        }
    }

    fn startup(&mut self) {
        let Config { user, dbname, .. } = &self.config;
        Startup {
            user: user.as_str(),
            database: Some(dbname.as_str()),
            replication: None,
        }
        .write(&mut self.write_buf);

        if self.config.verbosity >= Verbosity::Messages {
            debug!("-> Startup");
        }
        self.state = State::Authenticating;
    }

    fn send<F: FrontendProtocol>(&mut self, msg: F) {
        if self.config.verbosity >= Verbosity::Messages {
            debug!("-> {}", F::NAME);
        }
        verbose!(msg = F::NAME, "send");
        frontend::write(msg, &mut self.write_buf);
    }

    fn read_frames(&mut self) {
        while self.state != State::Closed {
            let frame = match split_frame(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return self.fail(err.into()),
            };

            if let Err(err) = self.frame(frame) {
                self.fail(err);
            }
        }
    }

    fn frame(&mut self, frame: Frame) -> Result<(), Error> {
        let tag = frame.tag;

        if self.config.verbosity >= Verbosity::Frames {
            debug!("<- frame {:?} length {}", tag as char, frame.body.len() + 4);
        }

        let Some(message) = BackendMessage::decode(frame)? else {
            warning!("skipped unknown message {:?}", tag as char);
            return Ok(());
        };

        if self.config.verbosity >= Verbosity::Messages {
            debug!("<- {}", BackendMessage::message_name(tag));
        }
        verbose!(msg = BackendMessage::message_name(tag), "recv");

        self.message(message)
    }

    fn message(&mut self, message: BackendMessage) -> Result<(), Error> {
        let phase = self.state.name();
        let unexpected = |message: &BackendMessage| message.unexpected(phase);

        match message {
            BackendMessage::Authentication(auth) => {
                if self.state != State::Authenticating {
                    return Err(ProtocolError::unexpected(Authentication::MSGTYPE, phase).into());
                }
                self.authenticate(auth)?;
            }
            BackendMessage::ParameterStatus(param) => {
                trace!("parameter {} = {}", param.name, param.value);
                match self.params.iter_mut().find(|(n, _)| *n == param.name) {
                    Some((_, value)) => *value = param.value.clone(),
                    None => self.params.push((param.name.clone(), param.value.clone())),
                }
                self.notifications.push_back(Notification::ParameterStatus {
                    name: param.name,
                    value: param.value,
                });
            }
            BackendMessage::BackendKeyData(key) => self.backend_key = Some(key),
            BackendMessage::NoticeResponse(notice) => {
                info!("{notice}");
                self.notifications.push_back(Notification::Notice(notice));
            }
            BackendMessage::ErrorResponse(err) => self.server_error(err)?,
            BackendMessage::ReadyForQuery(ready) => self.ready(ready)?,
            BackendMessage::CopyInResponse(_) | BackendMessage::CopyBothResponse(_) => {
                let Some(in_flight) = self.in_flight.as_mut() else {
                    return Err(unexpected(&message).into());
                };
                in_flight.fail(UnsupportedCopy.into());
                // backend answers with ErrorResponse and ReadyForQuery
                self.send(CopyFail { message: "copy from the client is not supported" });
            }
            message => {
                let Some(in_flight) = self.in_flight.as_mut() else {
                    return Err(unexpected(&message).into());
                };
                match message {
                    BackendMessage::RowDescription(desc) => in_flight.describe(desc.fields),
                    BackendMessage::DataRow(row) => in_flight.data_row(row.values),
                    BackendMessage::CommandComplete(complete) => {
                        trace!("complete: {}", complete.tag);
                        in_flight.complete(complete.rows_affected())
                    }
                    BackendMessage::EmptyQueryResponse(_) => {}
                    BackendMessage::CopyOutResponse(_) => in_flight.fail(UnsupportedCopy.into()),
                    BackendMessage::CopyData(_) | BackendMessage::CopyDone(_) => {}
                    message => return Err(unexpected(&message).into()),
                }
            }
        }

        Ok(())
    }

    fn authenticate(&mut self, auth: Authentication) -> Result<(), Error> {
        match auth {
            Authentication::Ok => {
                debug!("authenticated");
            }
            Authentication::CleartextPassword => {
                let password = self.config.pass.clone();
                self.send(PasswordMessage { password: &password });
            }
            Authentication::MD5Password { salt } => {
                let password = md5_password(&self.config.user, &self.config.pass, salt);
                self.send(PasswordMessage { password: &password });
            }
            auth => return Err(UnsupportedAuth::new(auth.method_name()).into()),
        }
        Ok(())
    }

    fn server_error(&mut self, err: ErrorResponse) -> Result<(), Error> {
        if err.is_fatal() {
            return Err(err.into());
        }

        debug!("{err}");
        self.notifications.push_back(Notification::Error(Arc::new(err.clone().into())));

        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.fail(err.into());
        }

        Ok(())
    }

    fn ready(&mut self, ready: ReadyForQuery) -> Result<(), Error> {
        self.transaction = ready.status;

        match self.state {
            State::Authenticating => {
                info!("connected to {}:{}", self.config.host, self.config.port);
                self.state = State::Idle;
                self.notifications.push_back(Notification::Connected {
                    backend_key: self.backend_key,
                });
            }
            State::Busy => {
                self.state = State::Idle;
                if let Some(in_flight) = self.in_flight.take() {
                    in_flight.resolve();
                }
            }
            State::Idle | State::Closing => {
                warning!("unsolicited ReadyForQuery in {} state", self.state.name());
            }
            State::Connecting | State::Closed => {
                return Err(ProtocolError::unexpected(ReadyForQuery::MSGTYPE, self.state.name()).into());
            }
        }

        self.drive();
        Ok(())
    }

    /// Send the next queued command, or terminate when draining is done.
    fn drive(&mut self) {
        if self.state != State::Idle {
            return;
        }

        while let Some(command) = self.queue.pop_front() {
            if let Err(err) = command.check() {
                debug!("command rejected: {err}");
                command.fail(err.into());
                continue;
            }
            self.send(Query { sql: command.sql() });
            self.in_flight = Some(InFlight::new(command));
            self.state = State::Busy;
            return;
        }

        if self.closing {
            self.send(Terminate);
            self.state = State::Closing;
        }
    }

    fn closed(&mut self) {
        debug!("connection closed");
        self.state = State::Closed;
        self.reject_all();
        self.notifications.push_back(Notification::Closed);
    }

    /// Fatal failure, every pending command is rejected.
    fn fail(&mut self, err: Error) {
        error!("connection failed: {err}");
        self.state = State::Closed;
        self.closing = true;
        self.read_buf.clear();
        self.write_buf.clear();
        self.reject_all();
        self.notifications.push_back(Notification::Error(Arc::new(err)));
        self.notifications.push_back(Notification::Closed);
    }

    fn reject_all(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.reject();
        }
        while let Some(command) = self.queue.pop_front() {
            command.reject();
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .field("closing", &self.closing)
            .field("pending", &self.pending())
            .field("transaction", &self.transaction)
            .finish()
    }
}
