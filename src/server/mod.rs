//! Server engine: the composition root
//!
//! Binds the listener, wires the timer wheel, admission counter, TLS and
//! protocol selection per accepted connection, and exposes the running
//! engine as a resource whose release performs a deterministic shutdown.

mod admission;

pub use admission::{AdmissionPermit, ConnectionAdmission};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerOptions;
use crate::handler::{ConnectionContext, Timeouts, TlsInfo};
use crate::http1::Http1Exchange;
use crate::stage::{accept_with_deadline, build_acceptor, select_protocol, Duplex, SelectedProtocol};
use crate::timer::{DeadlineMailbox, TimeoutKind, TimerWheel};
use crate::{EngineError, Result};

/// Counter for engine-unique connection ids; uniqueness is all that
/// matters, so relaxed ordering suffices
static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Builds and starts server engines
pub struct ServerEngine;

impl ServerEngine {
    /// Bind the listener and start accepting connections
    ///
    /// Validation warnings (timeout relations, multiplexing without TLS)
    /// never fail startup; contradictions in the options do.
    ///
    /// # Errors
    ///
    /// Returns error if the options are contradictory, TLS material cannot
    /// be loaded, or the address cannot be bound
    pub async fn start(options: ServerOptions) -> Result<Server> {
        let options = options.validate()?;

        let acceptor = match &options.tls {
            Some(tls) => Some(build_acceptor(tls, options.multiplexing)?),
            None => None,
        };

        let listener = TcpListener::bind(options.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        for line in &options.banner {
            info!("{line}");
        }
        info!(
            address = %local_addr,
            max_connections = options.max_connections,
            tls = acceptor.is_some(),
            "engine listening"
        );

        // size the wheel so every configured timeout fits one revolution
        let slots = (options.max_timeout().as_nanos() / options.tick.as_nanos() + 2)
            .max(64) as usize;
        let wheel = TimerWheel::with_slots(options.tick, slots);
        wheel.spawn_driver();

        let admission = ConnectionAdmission::new(options.max_connections);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(options),
            wheel.clone(),
            admission.clone(),
            acceptor,
            shutdown_rx,
        ));

        Ok(Server {
            local_addr,
            shutdown_tx,
            accept_task: Some(accept_task),
            wheel,
            admission,
        })
    }
}

/// A running server engine
///
/// Dropping the value aborts the accept loop and stops the wheel; prefer
/// [`Server::shutdown`] for a graceful drain.
pub struct Server {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    wheel: TimerWheel,
    admission: ConnectionAdmission,
}

impl Server {
    /// The bound listening address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current number of admitted connections
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.admission.active()
    }

    /// Stop accepting, drain in-flight exchanges, release the wheel
    ///
    /// In-flight exchanges finish or are cut off by the configured drain
    /// timeout; their own deadlines keep bounding them while draining.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.wheel.shutdown();
        info!("engine stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.wheel.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("active", &self.admission.active())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    options: Arc<ServerOptions>,
    wheel: TimerWheel,
    admission: ConnectionAdmission,
    acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let permit = match admission.try_admit() {
                            Ok(permit) => permit,
                            Err(e) => {
                                // hard cap: close before any stage work
                                debug!(%peer_addr, error = %e, "connection rejected");
                                drop(stream);
                                continue;
                            }
                        };

                        let options = Arc::clone(&options);
                        let wheel = wheel.clone();
                        let acceptor = acceptor.clone();
                        connections.spawn(serve_connection(
                            stream, peer_addr, permit, options, wheel, acceptor,
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            // reap finished connection tasks so the set stays small
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!("listener shutting down");
                break;
            }
        }
    }
    drop(listener);

    // drain in-flight exchanges, bounded
    let drained = timeout(options.shutdown_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "drain timeout reached, aborting remaining connections"
        );
        connections.shutdown().await;
    }
    info!("shutdown complete");
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: AdmissionPermit,
    options: Arc<ServerOptions>,
    wheel: TimerWheel,
    acceptor: Option<TlsAcceptor>,
) {
    let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    match drive_connection(stream, peer_addr, id, options, wheel, acceptor).await {
        Ok(()) => trace!(connection = id, "connection closed"),
        Err(e) if e.is_normal_close() => {
            debug!(connection = id, "connection reclaimed after idle timeout");
        }
        Err(EngineError::TransportClosed) => {
            debug!(connection = id, "connection closed by peer");
        }
        Err(e) => {
            // connection-scope failure; never escalates past this task
            debug!(connection = id, error = %e, "connection failed");
        }
    }

    // slot released exactly once, whichever path led here
    drop(permit);
}

async fn drive_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: u64,
    options: Arc<ServerOptions>,
    wheel: TimerWheel,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let local_addr = stream.local_addr()?;
    let timeouts = Timeouts {
        response_header: options.response_header_timeout,
        request: options.request_timeout,
        idle: options.idle_timeout,
    };
    let mut mailbox = DeadlineMailbox::new(wheel);

    let io = match &acceptor {
        Some(acceptor) => {
            // a peer that never completes the handshake is cut off by the
            // idle deadline
            mailbox.arm(TimeoutKind::Idle, options.idle_timeout);
            let tls = accept_with_deadline(acceptor, stream, &mut mailbox).await?;
            mailbox.disarm(TimeoutKind::Idle);

            let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            let protocol_version = tls.get_ref().1.protocol_version();

            match select_protocol(alpn.as_deref(), options.multiplexing)? {
                SelectedProtocol::Multiplexed => {
                    let ctx = ConnectionContext {
                        id,
                        local_addr,
                        peer_addr,
                        tls: Some(TlsInfo {
                            alpn_protocol: alpn,
                            protocol_version,
                        }),
                        timeouts,
                    };
                    let factory = options
                        .mux_factory
                        .as_ref()
                        .expect("validated options carry a mux driver when multiplexing");
                    return factory.call(tls, ctx).await;
                }
                SelectedProtocol::Http1 => {
                    let info = TlsInfo {
                        alpn_protocol: alpn,
                        protocol_version,
                    };
                    (Duplex::Tls(Box::new(tls)), Some(info))
                }
            }
        }
        None => (Duplex::Plain(stream), None),
    };

    let (io, tls_info) = io;
    let ctx = ConnectionContext {
        id,
        local_addr,
        peer_addr,
        tls: tls_info,
        timeouts,
    };

    Http1Exchange::new(io, ctx, options, mailbox).run().await
}
