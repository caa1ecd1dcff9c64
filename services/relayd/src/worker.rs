//! Worker pool and connection dispatch.
//!
//! Each worker is one OS thread running a single-threaded reactor. The
//! acceptor (worker 0) hands every accepted connection to exactly one
//! worker through that worker's dispatch channel, the cross-thread wake
//! primitive: any thread may send, delivery is FIFO, and a send wakes the
//! owning reactor. Workers never touch each other's pairs.
//!
//! Round-robin selection skips the acceptor's own worker when more than
//! one worker exists, since worker 0 also services every accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::RelayTuple;
use crate::pair;
use crate::socket;

/// Hand-off record from the acceptor to a worker: the accepted socket
/// (already non-blocking) and the index of the relay tuple it arrived on.
pub struct Dispatch {
    pub stream: std::net::TcpStream,
    pub peer: SocketAddr,
    pub tuple_id: usize,
}

/// Monotonic per-worker counters, readable from any thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Connections handed to this worker.
    pub dispatched: AtomicU64,
    /// Pairs currently being forwarded.
    pub live_pairs: AtomicU64,
}

/// The sending side of the pool: dispatch channels plus the round-robin
/// cursor. Shared by every accept loop.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Dispatch>>,
    stats: Vec<Arc<WorkerStats>>,
    rr: AtomicUsize,
}

/// Everything one worker thread owns: its dispatch receiver, the shared
/// read-only tuple table, and its counters.
pub struct WorkerContext {
    pub id: usize,
    rx: mpsc::UnboundedReceiver<Dispatch>,
    tuples: Arc<[RelayTuple]>,
    stats: Arc<WorkerStats>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Create `max(1, n)` workers. Returns the pool (for dispatch) and one
    /// context per worker (for the worker threads).
    pub fn new(
        n: usize,
        tuples: Arc<[RelayTuple]>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<WorkerContext>) {
        let n = n.max(1);
        debug!(size = n, "Create worker pool");

        let mut senders = Vec::with_capacity(n);
        let mut stats = Vec::with_capacity(n);
        let mut contexts = Vec::with_capacity(n);
        for id in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_stats = Arc::new(WorkerStats::default());
            senders.push(tx);
            stats.push(Arc::clone(&worker_stats));
            contexts.push(WorkerContext {
                id,
                rx,
                tuples: Arc::clone(&tuples),
                stats: worker_stats,
                shutdown: shutdown.clone(),
            });
        }

        (
            Self {
                senders,
                stats,
                rr: AtomicUsize::new(0),
            },
            contexts,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    pub fn stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }

    /// Advance the round-robin cursor, skipping the acceptor's worker
    /// (index 0) whenever there is more than one worker. The cursor is a
    /// relaxed atomic; fairness is approximate by design.
    fn next_worker(&self) -> usize {
        let n = self.senders.len();
        let mut idx = self.rr.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if n > 1 && idx % n == 0 {
            idx = self.rr.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        idx % n
    }

    /// Hand an accepted connection to the chosen worker.
    pub fn dispatch(&self, dispatch: Dispatch) {
        let target = self.next_worker();
        trace!(worker = target, from = %dispatch.peer, "Notify worker");
        if self.senders[target].send(dispatch).is_err() {
            // Worker already stopped; dropping the record closes the socket.
            warn!(worker = target, "Worker gone, dropping connection");
            return;
        }
        self.stats[target].dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-worker engine loop: receive dispatches, adopt each accepted
/// connection, and run its pair as an independent task until shutdown.
pub async fn engine_loop(mut ctx: WorkerContext) {
    debug!(id = ctx.id, "Run worker");
    loop {
        tokio::select! {
            dispatch = ctx.rx.recv() => match dispatch {
                Some(dispatch) => adopt_accepted(dispatch, &ctx),
                None => break,
            },
            _ = ctx.shutdown.changed() => break,
        }
    }
    debug!(id = ctx.id, "Worker stopped");
}

/// Promote the dispatched socket, connect outbound, and spawn the pair.
/// Every failure here abandons this connection only.
fn adopt_accepted(dispatch: Dispatch, ctx: &WorkerContext) {
    let Some(tuple) = ctx.tuples.get(dispatch.tuple_id).copied() else {
        warn!(tuple_id = dispatch.tuple_id, "Not found relay tuple");
        return;
    };
    let stats = Arc::clone(&ctx.stats);
    let worker = ctx.id;

    tokio::spawn(async move {
        let client = match TcpStream::from_std(dispatch.stream) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, from = %dispatch.peer, "Fail to register client socket");
                return;
            }
        };
        info!(from = %dispatch.peer, worker, "New conn");

        let server = match socket::create_connection(tuple.src, tuple.dst).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    error = %e,
                    src = ?tuple.src,
                    dst = %tuple.dst,
                    "Fail to connect"
                );
                return; // dropping the client closes the inbound socket
            }
        };
        debug!(
            from = %dispatch.peer,
            laddr = ?server.local_addr().ok(),
            raddr = %tuple.dst,
            "Connected to"
        );

        stats.live_pairs.fetch_add(1, Ordering::Relaxed);
        debug!(from = %dispatch.peer, to = %tuple.dst, "Forward");
        let _ = pair::run_pair(client, server, dispatch.peer, tuple.dst).await;
        stats.live_pairs.fetch_sub(1, Ordering::Relaxed);
    });
}
