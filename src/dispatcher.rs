//! Per-session dispatch loop
//!
//! One [`WorkDispatcher`] owns one probe session. Each cycle claims the
//! least recently checked eligible target, hands it to the probe, collects
//! batches until `Done` and persists them. A claimed target is invisible to
//! every other session until the cycle finishes, the claim is released, or
//! the lease runs out. Samples of an unfinished cycle are dropped; the
//! target stays oldest and is picked again later.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{MeasurementSample, UrlTarget};
use crate::protocol::{Message, ProtocolError, SessionChannel};
use crate::storage::{StorageError, Store};

/// Why a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No eligible target was left
    Drained,
    /// Shutdown was requested
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub cycles: usize,
    pub samples: usize,
    pub end: SessionEnd,
}

/// Errors that end a session
#[derive(Debug)]
pub enum SessionError {
    Protocol(ProtocolError),
    Storage(StorageError),

    /// The probe went away before finishing an assignment
    Lost { url: String, discarded: usize },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(e) => write!(f, "protocol violation: {}", e),
            SessionError::Storage(e) => write!(f, "store failure: {}", e),
            SessionError::Lost { url, discarded } => write!(
                f,
                "session lost while measuring {} ({} samples discarded)",
                url, discarded
            ),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(e) => Some(e),
            SessionError::Storage(e) => Some(e),
            SessionError::Lost { .. } => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Protocol(err)
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err)
    }
}

/// How long a session may hold a target, and how often it looks again
/// when every eligible target is held by another session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub lease: Duration,
    pub retry: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(600),
            retry: Duration::from_secs(1),
        }
    }
}

pub struct WorkDispatcher<S> {
    channel: SessionChannel<S>,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    peer: String,
    claims: ClaimPolicy,
}

impl<S> WorkDispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        io: S,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            channel: SessionChannel::new(io),
            store,
            cancel,
            peer: peer.into(),
            claims: ClaimPolicy::default(),
        }
    }

    pub fn with_claims(mut self, claims: ClaimPolicy) -> Self {
        self.claims = claims;
        self
    }

    /// Drive the session until no work is left, shutdown, or a fatal error
    ///
    /// Cancellation is only observed between cycles, so an assignment that
    /// is in flight always completes first.
    #[instrument(skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self) -> Result<SessionSummary, SessionError> {
        let mut cycles = 0;
        let mut persisted = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested, releasing probe");
                self.channel.send(&Message::Exit).await?;
                return Ok(SessionSummary {
                    cycles,
                    samples: persisted,
                    end: SessionEnd::Shutdown,
                });
            }

            let Some(target) = self.claim().await? else {
                if self.store.list_targets().await?.iter().any(|t| t.is_eligible()) {
                    // everything eligible is being measured by other sessions
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.claims.retry) => {}
                    }
                    continue;
                }

                info!("no eligible target left, ending session");
                self.channel.send(&Message::Exit).await?;
                return Ok(SessionSummary {
                    cycles,
                    samples: persisted,
                    end: SessionEnd::Drained,
                });
            };

            match self.cycle(&target).await {
                Ok(count) => persisted += count,
                Err(e) => {
                    if let Err(release) = self.store.release_claim(target.id).await {
                        warn!("claim on target {} left to expire: {release}", target.id);
                    }
                    return Err(e);
                }
            }
            cycles += 1;
        }
    }

    async fn claim(&self) -> Result<Option<UrlTarget>, SessionError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.claims.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        Ok(self.store.claim_next_target(now, now + lease).await?)
    }

    #[instrument(skip_all, fields(url = %target.url))]
    async fn cycle(&mut self, target: &UrlTarget) -> Result<usize, SessionError> {
        debug!("assigning target {}", target.id);
        self.channel
            .send(&Message::UrlAssignment {
                url: target.url.clone(),
            })
            .await?;

        let mut pending: Vec<MeasurementSample> = Vec::new();
        loop {
            match self.channel.recv().await {
                Ok(Some(Message::MeasurementBatch { samples })) => {
                    if samples.iter().any(|s| s.url.trim().is_empty()) {
                        return Err(ProtocolError::Malformed(
                            "measurement sample without url".to_string(),
                        )
                        .into());
                    }
                    debug!("received batch of {} samples", samples.len());
                    pending.extend(samples);
                }
                Ok(Some(Message::Done)) => break,
                Ok(Some(other)) => {
                    return Err(ProtocolError::Unexpected {
                        expected: "measurement_batch or done",
                        received: other.kind(),
                    }
                    .into());
                }
                Ok(None) | Err(ProtocolError::Io(_)) | Err(ProtocolError::ConnectionClosed) => {
                    warn!("probe disconnected mid-cycle");
                    return Err(SessionError::Lost {
                        url: target.url.clone(),
                        discarded: pending.len(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let count = pending.len();
        self.store.insert_samples(pending).await?;
        self.store.mark_checked(target.id, Utc::now()).await?;

        info!("persisted {} samples", count);
        Ok(count)
    }
}
