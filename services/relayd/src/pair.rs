//! Per-pair forwarding state machine.
//!
//! A connection pair is one accepted client plus its outbound server
//! connection. Each direction (client-to-server, server-to-client) owns a
//! [`ForwardBuffer`] and runs as a poll-driven copy: read interest is the
//! act of polling the reader, so pausing reads at the high-water mark and
//! resuming them after writes drain is just a branch, not reactor
//! bookkeeping. Both directions are polled in the same task, which keeps
//! one slow writer from blocking the opposite half-stream.
//!
//! Half-close: a read of 0 marks the direction `read_done`; once the
//! buffer drains, the writer is shut down (TCP FIN) and the direction
//! resolves. The pair resolves when both directions do. The first I/O
//! error cancels the other direction and drops both streams, closing the
//! sockets.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, error, trace};

use crate::buffer::ForwardBuffer;

/// A forwarding direction failed; the pair tears down both sockets.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// Byte counters for a completed pair.
#[derive(Debug, Clone, Copy)]
pub struct PairSummary {
    /// Bytes delivered client to server.
    pub in_bytes: u64,
    /// Bytes delivered server to client.
    pub out_bytes: u64,
}

/// One direction of a pair: reader peer, writer peer, and the buffer
/// between them.
pub struct CopyDirection {
    buf: ForwardBuffer,
    /// Set when the previous read filled the prepared region exactly.
    grow: bool,
    read_done: bool,
    write_done: bool,
    read_count: u64,
    write_count: u64,
    /// Remote address of the peer being read from, for log context.
    from: SocketAddr,
    /// Remote address of the peer being written to.
    to: SocketAddr,
}

impl CopyDirection {
    pub fn new(from: SocketAddr, to: SocketAddr) -> Self {
        Self::with_buffer(from, to, ForwardBuffer::new())
    }

    pub fn with_buffer(from: SocketAddr, to: SocketAddr, buf: ForwardBuffer) -> Self {
        Self {
            buf,
            grow: false,
            read_done: false,
            write_done: false,
            read_count: 0,
            write_count: 0,
            from,
            to,
        }
    }

    /// Bytes read from the source peer so far.
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// Bytes written to the destination peer so far.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// Drive this direction with the given halves.
    pub fn run<'a, R, W>(&'a mut self, reader: &'a mut R, writer: &'a mut W) -> Forward<'a, R, W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Forward {
            dir: self,
            reader,
            writer,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<Result<(), ForwardError>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let mut progressed = false;

            // Read while the peer is open and the buffer is below the
            // high-water mark. Not polling the reader here is what pauses
            // the stream under backpressure; the drain below re-enters
            // this branch on the next loop iteration.
            if !self.read_done && !self.buf.at_high_water() {
                let span = self.buf.prepare(self.grow);
                let span_len = span.len();
                let mut read_buf = ReadBuf::new(span);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            debug!(peer = %self.from, "Closed by");
                            self.read_done = true;
                        } else {
                            self.grow = n == span_len;
                            self.buf.commit(n);
                            self.read_count += n as u64;
                            trace!(from = %self.from, n, "Read");
                        }
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error!(from = %self.from, to = %self.to, error = %e, "Fail to read");
                        return Poll::Ready(Err(ForwardError::Read(e)));
                    }
                }
            }

            // Drain buffered bytes. Partial writes leave the rest for the
            // next readiness; ordering within the direction is the buffer's
            // FIFO order.
            while !self.buf.is_empty() {
                match writer.as_mut().poll_write(cx, self.buf.data()) {
                    Poll::Pending => break,
                    Poll::Ready(Ok(0)) => {
                        let e = io::Error::new(io::ErrorKind::WriteZero, "write returned 0");
                        error!(from = %self.from, to = %self.to, error = %e, "Fail to write");
                        return Poll::Ready(Err(ForwardError::Write(e)));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.buf.consume(n);
                        self.write_count += n as u64;
                        trace!(to = %self.to, n, "Write");
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error!(from = %self.from, to = %self.to, error = %e, "Fail to write");
                        return Poll::Ready(Err(ForwardError::Write(e)));
                    }
                }
            }

            // EOF seen and everything flushed: propagate the half-close.
            if self.read_done && self.buf.is_empty() {
                if !self.write_done {
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(())) => {
                            self.write_done = true;
                            debug!(
                                from = %self.from,
                                to = %self.to,
                                read = self.read_count,
                                write = self.write_count,
                                "Close half conn"
                            );
                        }
                        Poll::Ready(Err(e)) => {
                            error!(from = %self.from, to = %self.to, error = %e, "Fail to write");
                            return Poll::Ready(Err(ForwardError::Write(e)));
                        }
                    }
                }
                return Poll::Ready(Ok(()));
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

/// Future driving one [`CopyDirection`]. Resolves when the direction has
/// propagated EOF, or with the first I/O error.
pub struct Forward<'a, R, W> {
    dir: &'a mut CopyDirection,
    reader: &'a mut R,
    writer: &'a mut W,
}

impl<R, W> Future for Forward<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    type Output = Result<(), ForwardError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.dir
            .poll_copy(cx, Pin::new(&mut *this.reader), Pin::new(&mut *this.writer))
    }
}

/// Forward between an accepted client and its server connection until both
/// directions have closed, then emit the summary.
///
/// On error the other direction is cancelled and both streams drop here,
/// which closes both sockets at once.
pub async fn run_pair(
    client: TcpStream,
    server: TcpStream,
    client_peer: SocketAddr,
    server_peer: SocketAddr,
) -> Result<PairSummary, ForwardError> {
    let started = Instant::now();

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut server_rd, mut server_wr) = server.into_split();

    let mut inbound = CopyDirection::new(client_peer, server_peer);
    let mut outbound = CopyDirection::new(server_peer, client_peer);

    let result = tokio::try_join!(
        inbound.run(&mut client_rd, &mut server_wr),
        outbound.run(&mut server_rd, &mut client_wr),
    );

    let summary = PairSummary {
        in_bytes: inbound.write_count(),
        out_bytes: outbound.write_count(),
    };
    debug!(
        from = %client_peer,
        to = %server_peer,
        in_bytes = summary.in_bytes,
        out_bytes = summary.out_bytes,
        dur = started.elapsed().as_secs_f64(),
        "Forward done"
    );

    result.map(|_| summary)
}
