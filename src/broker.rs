//! Rendezvous listener handing each probe a dedicated session port
//!
//! ```text
//! LISTENING → HANDSHAKE_ACCEPTED → PORT_ALLOCATED → HANDSHAKE_CLOSED
//!           → SESSION_OPEN → SESSION_CLOSED
//! ```
//!
//! The accept loop runs on a single task and wakes up at least once per
//! poll interval to observe the shutdown token. Every session runs on its
//! own task with its own [`WorkDispatcher`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ServerSettings;
use crate::dispatcher::{ClaimPolicy, WorkDispatcher};
use crate::protocol::SessionChannel;
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    HandshakeAccepted,
    PortAllocated,
    HandshakeClosed,
    SessionOpen,
    SessionClosed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::HandshakeAccepted => "handshake_accepted",
            SessionPhase::PortAllocated => "port_allocated",
            SessionPhase::HandshakeClosed => "handshake_closed",
            SessionPhase::SessionOpen => "session_open",
            SessionPhase::SessionClosed => "session_closed",
        };
        f.write_str(name)
    }
}

pub struct ConnectionBroker {
    listener: TcpListener,
    store: Arc<dyn Store>,
    accept_poll: Duration,
    session_accept_timeout: Duration,
    claims: ClaimPolicy,
}

impl ConnectionBroker {
    pub async fn bind(settings: &ServerSettings, store: Arc<dyn Store>) -> io::Result<Self> {
        let listener = TcpListener::bind((settings.bind, settings.handshake_port)).await?;
        info!("listening for probes on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            store,
            accept_poll: settings.accept_poll(),
            session_accept_timeout: settings.session_accept_timeout(),
            claims: settings.claim_policy(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept probes until `cancel` fires, then wait for every session to end
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        let mut sessions = JoinSet::new();

        while !cancel.is_cancelled() {
            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    error!("session task failed: {e}");
                }
            }

            let (stream, peer) =
                match tokio::time::timeout(self.accept_poll, self.listener.accept()).await {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!("failed to accept handshake: {e}");
                        continue;
                    }
                    Ok(Ok(accepted)) => accepted,
                };
            trace!(%peer, phase = %SessionPhase::HandshakeAccepted);

            let session_listener = match allocate_session(stream, peer).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(%peer, "handshake failed: {e}");
                    continue;
                }
            };

            sessions.spawn(serve_session(
                session_listener,
                peer,
                self.store.clone(),
                cancel.clone(),
                self.session_accept_timeout,
                self.claims,
            ));
        }

        info!("shutting down, waiting for {} sessions", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("session task failed: {e}");
            }
        }
    }
}

/// Bind the dedicated port, announce it and close the handshake connection
async fn allocate_session(stream: TcpStream, peer: SocketAddr) -> io::Result<TcpListener> {
    let local_ip = stream.local_addr()?.ip();
    let listener = TcpListener::bind((local_ip, 0)).await?;
    let port = listener.local_addr()?.port();
    trace!(%peer, port, phase = %SessionPhase::PortAllocated);

    let mut handshake = SessionChannel::new(stream);
    handshake
        .send_port(port)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    drop(handshake);
    trace!(%peer, phase = %SessionPhase::HandshakeClosed);

    Ok(listener)
}

#[instrument(skip_all, fields(%peer))]
async fn serve_session(
    listener: TcpListener,
    peer: SocketAddr,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    accept_timeout: Duration,
    claims: ClaimPolicy,
) {
    let accepted = tokio::select! {
        _ = cancel.cancelled() => return,
        accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
    };

    let (stream, session_peer) = match accepted {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!("failed to accept session: {e}");
            return;
        }
        Err(_) => {
            warn!("probe never opened its session port");
            return;
        }
    };
    // the port served its purpose once the session is open
    drop(listener);
    debug!(%session_peer, phase = %SessionPhase::SessionOpen);

    match WorkDispatcher::new(stream, store, cancel, peer.to_string())
        .with_claims(claims)
        .run()
        .await
    {
        Ok(summary) => info!(
            cycles = summary.cycles,
            samples = summary.samples,
            "session ended: {:?}",
            summary.end
        ),
        Err(e) => error!("session aborted: {e}"),
    }
    trace!(phase = %SessionPhase::SessionClosed);
}
