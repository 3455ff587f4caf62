use futures_core::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};

use crate::{Result, error::ConnectionClosed, pipeline::Response, row::Row};

/// Rows of a streaming query, see [`Connection::fetch`][super::Connection::fetch].
///
/// Yields every row, then the command error if any.
#[derive(Debug)]
pub struct RowStream {
    rows: UnboundedReceiver<Row>,
    done: Option<oneshot::Receiver<Result<Response>>>,
    outcome: Option<Result<()>>,
}

impl RowStream {
    pub(crate) fn new(rows: UnboundedReceiver<Row>, done: oneshot::Receiver<Result<Response>>) -> Self {
        Self { rows, done: Some(done), outcome: None }
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        if let Some(done) = me.done.as_mut() {
            if let Poll::Ready(Some(row)) = me.rows.poll_recv(cx) {
                return Poll::Ready(Some(Ok(row)));
            }
            let result = ready!(Pin::new(done).poll(cx));
            me.done = None;
            me.outcome = Some(match result {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(ConnectionClosed.into()),
            });
        }

        // every row is sent before the command resolves
        if let Ok(row) = me.rows.try_recv() {
            return Poll::Ready(Some(Ok(row)));
        }

        Poll::Ready(me.outcome.take().and_then(Result::err).map(Err))
    }
}
