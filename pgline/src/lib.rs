//! Pipelined Postgres Driver
//!
//! Every command issued on a [`Connection`] is queued and sent over one socket,
//! strictly one at a time, using the simple query protocol. Callers never wait for
//! each other to issue commands, only for their own outcome.
//!
//! # Examples
//!
//! ```no_run
//! use pgline::Connection;
//!
//! # async fn app() -> pgline::Result<()> {
//! let conn = Connection::connect_env().await?;
//!
//! // queued in order, awaited in any order
//! let create = conn.execute("CREATE TEMP TABLE foo(id int, name text)");
//! let insert = conn.execute("INSERT INTO foo VALUES (1,'Ada'),(2,NULL)");
//! let select = conn.query("SELECT id, name FROM foo ORDER BY id");
//!
//! create.await?;
//! assert_eq!(insert.await?, 2);
//!
//! let rows = select.await?;
//! assert_eq!(rows[0].get("id").and_then(|v|v.as_i64()), Some(1));
//! assert!(rows[1].get("name").is_some_and(|v|v.is_null()));
//!
//! conn.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! The protocol layer is usable without any runtime, see [`phase::Machine`].

pub mod common;
mod ext;
#[cfg(feature = "tokio")]
mod net;

// Protocol
pub mod postgres;

// Component
pub mod row;
pub mod pipeline;
pub mod phase;

// Connection
pub mod connection;

pub mod error;

pub use row::{Row, Value, DecodeError};
pub use pipeline::{Command, InvalidSql, Response};
pub use phase::Notification;
pub use connection::{Config, Verbosity};
#[cfg(feature = "tokio")]
pub use connection::{Connection, RowStream};
#[cfg(feature = "tokio")]
pub use net::Socket;
pub use error::{Error, ErrorKind, Result};
