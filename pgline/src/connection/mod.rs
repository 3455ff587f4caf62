//! Postgres connection.
//!
//! A [`Connection`] is a cheap handle to a background worker task that owns the
//! socket. Commands from every clone are queued and run one at a time, in the
//! order they are issued.
mod config;
#[cfg(feature = "tokio")]
mod stream;
#[cfg(feature = "tokio")]
mod worker;

pub use config::{Config, ParseError, Verbosity};
#[cfg(feature = "tokio")]
pub use stream::RowStream;

#[cfg(feature = "tokio")]
pub use handle::Connection;

#[cfg(feature = "tokio")]
mod handle {
    use tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot,
        },
    };

    use super::{
        Config, RowStream,
        worker::{Request, WorkerFuture},
    };
    use crate::{
        Error, Result,
        error::ConnectionClosed,
        phase::Notification,
        pipeline::{Command, Response},
        row::Row,
    };

    /// Postgres connection handle.
    ///
    /// Cloning is cheap, every clone shares the same ordered command queue. Dropping
    /// every handle closes the connection gracefully once queued commands are done.
    #[derive(Clone, Debug)]
    pub struct Connection {
        send: UnboundedSender<Request>,
    }

    impl Connection {
        /// Connect using url, see [`Config::parse`].
        pub async fn connect(url: &str) -> Result<Connection> {
            Self::connect_with(Config::parse(url)?).await
        }

        /// Connect using environment variables, see [`Config::from_env`].
        pub async fn connect_env() -> Result<Connection> {
            Self::connect_with(Config::from_env()?).await
        }

        /// Connect and wait until the connection is ready for query.
        pub async fn connect_with(config: Config) -> Result<Connection> {
            let (send, recv) = mpsc::unbounded_channel();
            let (notify, mut notifications) = mpsc::unbounded_channel();

            let mut worker = WorkerFuture::connect(config, recv);
            worker.subscribe(notify);
            tokio::spawn(worker);

            while let Some(notification) = notifications.recv().await {
                match notification {
                    Notification::Connected { .. } => return Ok(Connection { send }),
                    Notification::Error(err) => return Err(Error::unshare(err)),
                    Notification::Closed => break,
                    _ => {}
                }
            }

            Err(ConnectionClosed.into())
        }

        /// Connect in the background.
        ///
        /// Commands issued before the handshake completes are queued.
        pub fn connect_lazy_with(config: Config) -> Connection {
            let (send, recv) = mpsc::unbounded_channel();
            tokio::spawn(WorkerFuture::connect(config, recv));
            Connection { send }
        }

        /// Run the connection over an already connected transport.
        ///
        /// The startup handshake is sent right away, commands are queued until it completes.
        pub fn with_transport<S>(io: S, config: Config) -> Connection
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let (send, recv) = mpsc::unbounded_channel();
            tokio::spawn(WorkerFuture::with_transport(io, config, recv));
            Connection { send }
        }

        /// Queue a command, a dropped command resolves as closed.
        fn command(&self, command: Command) {
            let _ = self.send.send(Request::Command(command));
        }

        fn simple(&self, sql: String) -> oneshot::Receiver<Result<Response>> {
            let (tx, rx) = oneshot::channel();
            self.command(Command::new(sql, move |result| {
                let _ = tx.send(result);
            }));
            rx
        }

        /// Execute sql, returns the number of rows affected.
        ///
        /// The command is queued immediately, awaiting only waits for its outcome.
        pub fn execute(&self, sql: impl Into<String>) -> impl Future<Output = Result<u64>> + Send + 'static {
            let rx = self.simple(sql.into());
            async move { Ok(outcome(rx).await?.rows_affected) }
        }

        /// Execute sql and buffer every returned row.
        pub fn query(&self, sql: impl Into<String>) -> impl Future<Output = Result<Vec<Row>>> + Send + 'static {
            let rx = self.simple(sql.into());
            async move { Ok(outcome(rx).await?.rows) }
        }

        /// Execute sql, streaming each row into `sink`.
        ///
        /// The sink is called from the connection task, returns the number of rows affected.
        pub fn query_with<F>(&self, sql: impl Into<String>, sink: F) -> impl Future<Output = Result<u64>> + Send + 'static
        where
            F: FnMut(Row) + Send + 'static,
        {
            let (tx, rx) = oneshot::channel();
            let command = Command::new(sql, move |result| {
                let _ = tx.send(result);
            });
            self.command(command.with_sink(sink));
            async move { Ok(outcome(rx).await?.rows_affected) }
        }

        /// Execute sql, returning rows as a [`Stream`][futures_core::Stream].
        pub fn fetch(&self, sql: impl Into<String>) -> RowStream {
            let (rows_tx, rows_rx) = mpsc::unbounded_channel();
            let (tx, rx) = oneshot::channel();
            let command = Command::new(sql, move |result| {
                let _ = tx.send(result);
            });
            self.command(command.with_sink(move |row| {
                let _ = rows_tx.send(row);
            }));
            RowStream::new(rows_rx, rx)
        }

        /// Receive connection level notifications from now on.
        pub fn subscribe(&self) -> UnboundedReceiver<Notification> {
            let (send, recv) = mpsc::unbounded_channel();
            let _ = self.send.send(Request::Subscribe(send));
            recv
        }

        /// Close the connection once every queued command is resolved.
        ///
        /// Commands issued afterwards by any handle are rejected with [`ConnectionClosed`].
        pub fn close(&self) -> impl Future<Output = ()> + Send + 'static {
            let (tx, rx) = oneshot::channel();
            let _ = self.send.send(Request::Close(tx));
            async move {
                let _ = rx.await;
            }
        }

        /// Returns `true` if the connection worker is gone.
        pub fn is_closed(&self) -> bool {
            self.send.is_closed()
        }
    }

    async fn outcome(rx: oneshot::Receiver<Result<Response>>) -> Result<Response> {
        rx.await.map_err(|_| Error::from(ConnectionClosed))?
    }
}

#[cfg(all(test, feature = "tokio"))]
mod test {
    use bytes::{Buf, BytesMut};
    use futures_core::Stream;
    use std::{future::poll_fn, pin::Pin};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
        task::JoinHandle,
    };

    use super::*;
    use crate::{
        ErrorKind, Notification,
        postgres::{codec::split_frame, mock},
        row::{Row, Value},
    };

    /// Scripted server, `respond` writes the reply of a query or returns `false` to hang up.
    ///
    /// Resolves to `true` if the client sent `Terminate`.
    fn serve(mut io: DuplexStream, respond: fn(&str, &mut BytesMut) -> bool) -> JoinHandle<bool> {
        tokio::spawn(async move {
            let mut buf = BytesMut::new();

            // untagged startup message
            loop {
                if buf.len() >= 4 {
                    let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    if buf.len() >= len {
                        buf.advance(len);
                        break;
                    }
                }
                if io.read_buf(&mut buf).await.unwrap() == 0 {
                    return false;
                }
            }

            let mut out = BytesMut::new();
            mock::handshake(&mut out);
            io.write_all(&out).await.unwrap();

            loop {
                let Some(frame) = split_frame(&mut buf).unwrap() else {
                    if io.read_buf(&mut buf).await.unwrap() == 0 {
                        return false;
                    }
                    continue;
                };

                match frame.tag {
                    b'Q' => {
                        let sql = std::str::from_utf8(&frame.body[..frame.body.len() - 1]).unwrap();
                        out.clear();
                        if !respond(sql, &mut out) {
                            return false;
                        }
                        io.write_all(&out).await.unwrap();
                    }
                    b'X' => return true,
                    tag => panic!("unexpected frontend message {:?}", tag as char),
                }
            }
        })
    }

    /// `SELECT <n>` returns n, `INVALID` fails, `NOTICE` raises a notice, `HANG UP` drops the socket.
    fn respond(sql: &str, out: &mut BytesMut) -> bool {
        match sql {
            "HANG UP" => return false,
            "INVALID" => {
                mock::error(out, "ERROR", "42601", "syntax error at or near \"INVALID\"");
                mock::ready(out, b'I');
            }
            "NOTICE" => {
                mock::notice(out, "hello");
                mock::command_complete(out, "DO");
                mock::ready(out, b'I');
            }
            "SERIES" => mock::select_int(out, "n", &["1", "2", "3"]),
            "INSERT" => {
                mock::command_complete(out, "INSERT 0 4");
                mock::ready(out, b'I');
            }
            sql => {
                let n = sql.trim_start_matches("SELECT ");
                mock::select_int(out, "n", &[n]);
            }
        }
        true
    }

    fn connect() -> (Connection, JoinHandle<bool>) {
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::with_transport(client, Config::default());
        (conn, serve(server, respond))
    }

    fn n(rows: &[Row]) -> Option<i64> {
        rows[0].get("n").and_then(Value::as_i64)
    }

    #[tokio::test]
    async fn queries_resolve_in_order() {
        let (conn, server) = connect();

        let (a, b, c) = tokio::join!(conn.query("SELECT 1"), conn.query("SELECT 2"), conn.query("SELECT 3"));
        assert_eq!(n(&a.unwrap()), Some(1));
        assert_eq!(n(&b.unwrap()), Some(2));
        assert_eq!(n(&c.unwrap()), Some(3));

        assert_eq!(conn.execute("INSERT").await.unwrap(), 4);

        conn.close().await;
        assert!(server.await.unwrap());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn server_error_then_continue() {
        let (conn, _server) = connect();

        let first = conn.query("SELECT 1");
        let invalid = conn.execute("INVALID");
        let last = conn.query("SELECT 2");

        assert_eq!(n(&first.await.unwrap()), Some(1));
        let err = invalid.await.unwrap_err();
        assert_eq!(err.as_database().map(|e| e.code()), Some("42601"));
        assert_eq!(n(&last.await.unwrap()), Some(2));
    }

    #[tokio::test]
    async fn nul_in_sql_keeps_connection() {
        let (conn, _server) = connect();

        let bad = conn.execute("SELECT 'a\0b'");
        let next = conn.query("SELECT 7");

        assert!(matches!(bad.await.unwrap_err().kind(), ErrorKind::InvalidSql(_)));
        assert_eq!(n(&next.await.unwrap()), Some(7));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn close_drains_queue_then_rejects() {
        let (conn, server) = connect();

        let a = conn.query("SELECT 1");
        let b = conn.query("SELECT 2");
        let closed = conn.close();
        let late = conn.execute("SELECT 3");

        closed.await;
        assert_eq!(n(&a.await.unwrap()), Some(1));
        assert_eq!(n(&b.await.unwrap()), Some(2));
        assert!(late.await.unwrap_err().is_closed());
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn dropping_handles_terminates() {
        let (conn, server) = connect();
        let pending = conn.query("SELECT 7");
        drop(conn);
        assert_eq!(n(&pending.await.unwrap()), Some(7));
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn fetch_and_sink_stream_rows() {
        let (conn, _server) = connect();

        let mut stream = conn.fetch("SERIES");
        let mut fetched = vec![];
        while let Some(row) = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await {
            fetched.push(row.unwrap().get("n").and_then(Value::as_i64));
        }
        assert_eq!(fetched, [Some(1), Some(2), Some(3)]);

        let mut stream = conn.fetch("INVALID");
        let item = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await;
        assert!(matches!(item, Some(Err(e)) if e.as_database().is_some()));
        assert!(poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await.is_none());

        let seen = std::sync::Arc::new(std::sync::Mutex::new(0));
        let counter = seen.clone();
        let affected = conn.query_with("SERIES", move |_| *counter.lock().unwrap() += 1).await.unwrap();
        assert_eq!(affected, 3);
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn notifications_channel() {
        let (conn, _server) = connect();
        let mut notifications = conn.subscribe();

        conn.execute("NOTICE").await.unwrap();
        conn.execute("INVALID").await.unwrap_err();

        let mut seen = vec![];
        while let Ok(notification) = notifications.try_recv() {
            seen.push(notification);
        }
        assert!(seen.iter().any(|n| matches!(n, Notification::Notice(n) if n.message() == "hello")));
        assert!(seen.iter().any(|n| matches!(n, Notification::Error(e) if e.as_database().is_some())));
    }

    #[tokio::test]
    async fn hang_up_fails_pending() {
        let (conn, _server) = connect();
        let mut notifications = conn.subscribe();

        let lost = conn.query("HANG UP");
        let queued = conn.query("SELECT 1");

        assert!(lost.await.unwrap_err().is_closed());
        assert!(queued.await.unwrap_err().is_closed());
        assert!(conn.execute("SELECT 2").await.unwrap_err().is_closed());

        let mut io_error = false;
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::Error(e) => io_error |= matches!(e.kind(), ErrorKind::Io(_)),
                Notification::Closed => break,
                _ => {}
            }
        }
        assert!(io_error);
    }

    #[tokio::test]
    async fn invalid_url() {
        let err = Connection::connect("localhost").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config(_)));
    }
}
