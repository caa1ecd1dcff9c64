//! Top-level relay orchestration.
//!
//! `RelayServer::bind` creates every listener and the worker pool up
//! front, so any socket, bind, or listen failure is fatal before a single
//! thread spawns. `run` then places worker 0 (which also hosts every
//! accept loop) on the calling thread, spawns the remaining workers on
//! named OS threads, and joins them on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::RelayTuple;
use crate::socket;
use crate::worker::{self, Dispatch, WorkerContext, WorkerPool, WorkerStats};

/// Construction-time and run-time failures of the relay server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A bound, not-yet-running relay.
pub struct RelayServer {
    pool: Arc<WorkerPool>,
    workers: Vec<WorkerContext>,
    listeners: Vec<(std::net::TcpListener, usize)>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Cloneable view of a running relay: signal shutdown, read worker stats.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    stats: Vec<Arc<WorkerStats>>,
}

impl ServerHandle {
    /// Stop every worker and accept loop; `run` returns once all joined.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Connections dispatched to each worker since startup.
    pub fn dispatched_counts(&self) -> Vec<u64> {
        self.stats
            .iter()
            .map(|s| s.dispatched.load(Ordering::Relaxed))
            .collect()
    }

    /// Pairs currently being forwarded, per worker.
    pub fn live_pair_counts(&self) -> Vec<u64> {
        self.stats
            .iter()
            .map(|s| s.live_pairs.load(Ordering::Relaxed))
            .collect()
    }
}

impl RelayServer {
    /// Create the worker pool and bind a listener for every tuple.
    pub fn bind(tuples: Vec<RelayTuple>, worker_count: usize) -> Result<Self, ServerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tuples: Arc<[RelayTuple]> = tuples.into();
        let (pool, workers) = WorkerPool::new(worker_count, Arc::clone(&tuples), shutdown_rx.clone());

        let mut listeners = Vec::with_capacity(tuples.len());
        for (tuple_id, tuple) in tuples.iter().enumerate() {
            let listener = socket::create_listener(tuple.listen, true).map_err(|source| {
                ServerError::Bind {
                    addr: tuple.listen,
                    source,
                }
            })?;
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, dst = %tuple.dst, src = ?tuple.src, "Listen on");
            }
            listeners.push((listener, tuple_id));
        }

        Ok(Self {
            pool: Arc::new(pool),
            workers,
            listeners,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Actual listener addresses, in tuple order. Useful when a tuple
    /// asked for an ephemeral port.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|(listener, _)| listener.local_addr())
            .collect()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown_tx.clone(),
            stats: self.pool.stats().to_vec(),
        }
    }

    /// Run until shutdown. Worker 0 and the accept loops run on the
    /// calling thread; the rest of the pool runs on named OS threads.
    pub fn run(self) -> Result<(), ServerError> {
        let RelayServer {
            pool,
            workers,
            listeners,
            shutdown_tx,
            shutdown_rx,
        } = self;
        // Keep the shutdown channel open for the whole run; without this
        // the workers would observe a closed channel and exit at once.
        let _shutdown_guard = shutdown_tx;

        let mut workers = workers.into_iter();
        let worker0 = workers.next().expect("pool always has worker 0");

        let mut joins = Vec::new();
        for ctx in workers {
            let handle = std::thread::Builder::new()
                .name(format!("relay-worker-{}", ctx.id))
                .spawn(move || worker_thread(ctx))
                .map_err(ServerError::Spawn)?;
            joins.push(handle);
        }

        let runtime = worker_runtime().map_err(ServerError::Runtime)?;
        runtime.block_on(async move {
            for (listener, tuple_id) in listeners {
                tokio::spawn(accept_loop(
                    listener,
                    tuple_id,
                    Arc::clone(&pool),
                    shutdown_rx.clone(),
                ));
            }
            worker::engine_loop(worker0).await;
        });

        for join in joins {
            let _ = join.join();
        }
        Ok(())
    }
}

fn worker_runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
}

fn worker_thread(ctx: WorkerContext) {
    match worker_runtime() {
        Ok(runtime) => runtime.block_on(worker::engine_loop(ctx)),
        Err(e) => error!(id = ctx.id, error = %e, "Fail to build worker runtime"),
    }
}

/// Accept connections on one listener and dispatch each to a worker.
/// Accept errors are logged and the loop continues; a failing listener
/// never takes the relay down.
async fn accept_loop(
    listener: std::net::TcpListener,
    tuple_id: usize,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Fail to register listener");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Detach from this reactor; the owning worker
                    // re-registers the (still non-blocking) socket.
                    match stream.into_std() {
                        Ok(stream) => pool.dispatch(Dispatch { stream, peer, tuple_id }),
                        Err(e) => {
                            error!(error = %e, from = %peer, "Fail to detach accepted socket");
                        }
                    }
                }
                Err(e) => error!(error = %e, "Fail to accept"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
