use bytes::{Buf, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
};

use super::Config;
use crate::{
    common::trace,
    net::Socket,
    phase::{Event, Machine, Notification},
    pipeline::Command,
};

const READ_SIZE: usize = 8 * 1024;

/// Message from [`Connection`][super::Connection] handles to the worker.
pub enum Request {
    Command(Command),
    Subscribe(UnboundedSender<Notification>),
    Close(oneshot::Sender<()>),
}

type ConnectFuture<S> = Pin<Box<dyn Future<Output = io::Result<S>> + Send + 'static>>;

enum Transport<S> {
    Connecting(ConnectFuture<S>),
    Connected(S),
    Gone,
}

/// Drives a [`Machine`] over a transport.
///
/// Resolves when the connection is closed, either gracefully or by failure.
pub struct WorkerFuture<S> {
    machine: Machine,
    transport: Transport<S>,

    recv: UnboundedReceiver<Request>,
    recv_closed: bool,

    subscribers: Vec<UnboundedSender<Notification>>,
    closers: Vec<oneshot::Sender<()>>,

    read_buf: Box<[u8]>,
    write_buf: BytesMut,
    flushed: bool,
    shutdown: bool,
}

impl WorkerFuture<Socket> {
    /// Worker that first connects a [`Socket`].
    pub fn connect(config: Config, recv: UnboundedReceiver<Request>) -> Self {
        let target = config.clone();
        let connect = Box::pin(async move { Socket::connect(&target).await });
        Self::new(config, Transport::Connecting(connect), recv)
    }
}

impl<S> WorkerFuture<S> {
    /// Worker over an already connected transport.
    pub fn with_transport(io: S, config: Config, recv: UnboundedReceiver<Request>) -> Self {
        let mut me = Self::new(config, Transport::Connected(io), recv);
        me.machine.dispatch(Event::Connected);
        me
    }

    fn new(config: Config, transport: Transport<S>, recv: UnboundedReceiver<Request>) -> Self {
        Self {
            machine: Machine::new(config),
            transport,
            recv,
            recv_closed: false,
            subscribers: vec![],
            closers: vec![],
            read_buf: vec![0; READ_SIZE].into_boxed_slice(),
            write_buf: BytesMut::with_capacity(1024),
            flushed: true,
            shutdown: false,
        }
    }

    pub fn subscribe(&mut self, send: UnboundedSender<Notification>) {
        self.subscribers.push(send);
    }

    fn request(&mut self, request: Request) {
        match request {
            Request::Command(command) => self.machine.enqueue(command),
            Request::Subscribe(send) => self.subscribers.push(send),
            Request::Close(send) => {
                self.closers.push(send);
                self.machine.request_close();
            }
        }
    }

    fn poll_requests(&mut self, cx: &mut Context) -> bool {
        let mut progress = false;
        while !self.recv_closed {
            match self.recv.poll_recv(cx) {
                Poll::Ready(Some(request)) => self.request(request),
                Poll::Ready(None) => {
                    trace!("all connection handles dropped");
                    self.recv_closed = true;
                    self.machine.request_close();
                }
                Poll::Pending => break,
            }
            progress = true;
        }
        progress
    }

    fn forward_notifications(&mut self) {
        while let Some(notification) = self.machine.poll_notification() {
            self.subscribers.retain(|send| send.send(notification.clone()).is_ok());
        }
    }

    /// Reject whatever is still requested and release `close` waiters.
    fn finish(&mut self) {
        self.recv.close();
        while let Ok(request) = self.recv.try_recv() {
            self.request(request);
        }
        self.forward_notifications();
        for send in self.closers.drain(..) {
            let _ = send.send(());
        }
        self.transport = Transport::Gone;
    }
}

impl<S> WorkerFuture<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_connect(&mut self, cx: &mut Context) -> bool {
        let Transport::Connecting(connect) = &mut self.transport else {
            return false;
        };
        match connect.as_mut().poll(cx) {
            Poll::Ready(Ok(io)) => {
                self.transport = Transport::Connected(io);
                self.machine.dispatch(Event::Connected);
            }
            Poll::Ready(Err(err)) => {
                self.transport = Transport::Gone;
                self.machine.dispatch(Event::Error(err));
            }
            Poll::Pending => return false,
        }
        true
    }

    fn poll_write(&mut self, cx: &mut Context) -> bool {
        let Transport::Connected(io) = &mut self.transport else {
            return false;
        };

        if let Some(output) = self.machine.take_output() {
            self.write_buf.extend_from_slice(&output);
        }

        let mut progress = false;

        while !self.write_buf.is_empty() {
            match Pin::new(&mut *io).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    self.machine.dispatch(Event::Error(io::ErrorKind::WriteZero.into()));
                    return true;
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                    self.flushed = false;
                    progress = true;
                }
                Poll::Ready(Err(err)) => {
                    self.machine.dispatch(Event::Error(err));
                    return true;
                }
                Poll::Pending => return progress,
            }
        }

        if !self.flushed {
            match Pin::new(&mut *io).poll_flush(cx) {
                Poll::Ready(Ok(())) => self.flushed = true,
                Poll::Ready(Err(err)) => {
                    self.machine.dispatch(Event::Error(err));
                    return true;
                }
                Poll::Pending => return progress,
            }
        }

        if self.machine.wants_shutdown() && !self.shutdown {
            match Pin::new(&mut *io).poll_shutdown(cx) {
                Poll::Ready(result) => {
                    trace!("transport shutdown");
                    self.shutdown = true;
                    if let Err(err) = result {
                        self.machine.dispatch(Event::Error(err));
                    }
                    return true;
                }
                Poll::Pending => return progress,
            }
        }

        progress
    }

    fn poll_read(&mut self, cx: &mut Context) -> bool {
        let Transport::Connected(io) = &mut self.transport else {
            return false;
        };

        let mut buf = ReadBuf::new(&mut self.read_buf);
        match Pin::new(io).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => match buf.filled() {
                [] => self.machine.dispatch(Event::End),
                data => self.machine.dispatch(Event::Data(data)),
            },
            Poll::Ready(Err(err)) => self.machine.dispatch(Event::Error(err)),
            Poll::Pending => return false,
        }
        true
    }
}

impl<S> Future for WorkerFuture<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        // NOTE:
        // 1. Collect all request upfront
        // 2. Write whatever the machine produced
        // 3. Feed received bytes back into the machine
        loop {
            let mut progress = me.poll_requests(cx);
            progress |= me.poll_connect(cx);
            progress |= me.poll_write(cx);

            if !me.machine.is_closed() {
                progress |= me.poll_read(cx);
            }

            me.forward_notifications();

            if me.machine.is_closed() {
                trace!("worker finished");
                me.finish();
                return Poll::Ready(());
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}
