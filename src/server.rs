//! TCP listener and shutdown ordering.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    flush::Flusher,
    ingest::ingest,
    sink::BulkWriter,
    Error, Result,
};

/// Binds the listen address. Failure here is fatal for the process.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::bind(addr, source))
}

#[derive(Debug)]
pub struct Server<W> {
    listener: TcpListener,
    flusher: Arc<Flusher<W>>,
    shutdown_grace: Duration,
}
impl<W: BulkWriter> Server<W> {
    pub fn new(listener: TcpListener, flusher: Arc<Flusher<W>>, shutdown_grace: Duration) -> Self {
        Self {
            listener,
            flusher,
            shutdown_grace,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections and runs the flush timer until `shutdown` fires.
    ///
    /// Shutdown stops accepting, stops the flush timer and waits for an
    /// in-flight flush, gives open connections `shutdown_grace` to finish
    /// before aborting them, then flushes whatever they recorded.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            listener,
            flusher,
            shutdown_grace,
        } = self;
        let accumulator = flusher.accumulator().clone();
        let flush = flusher.clone().spawn();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let accumulator = accumulator.clone();
                        let span = info_span!("connection", %peer);
                        connections.spawn(
                            async move {
                                ingest(stream, &accumulator).await;
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        info!(connections = connections.len(), "shutting down");
        drop(listener);
        flush.stop().await;
        let drained = tokio::time::timeout(shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "closing connections still open");
            connections.shutdown().await;
        }
        let outcome = flusher.flush().await;
        info!(
            ?outcome,
            pending = accumulator.pending_count(),
            "final flush done"
        );
    }
}
