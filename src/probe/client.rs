//! Probe side of the handshake and the session loop

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use super::pool::WorkerPool;
use crate::protocol::{Message, ProtocolError, SessionChannel};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSummary {
    pub assignments: usize,
    pub samples: usize,
}

/// Ask the rendezvous port for a session port and connect to it
#[instrument]
pub async fn connect(server: &str, handshake_port: u16) -> Result<TcpStream, ProtocolError> {
    let handshake = TcpStream::connect((server, handshake_port)).await?;
    let mut channel = SessionChannel::new(handshake);
    let session_port = channel.recv_port().await?;
    drop(channel);

    debug!("session port {session_port} allocated");
    Ok(TcpStream::connect((server, session_port)).await?)
}

/// Serve assignments until the server sends `Exit` or goes away
pub async fn run_session<S>(
    io: S,
    pool: &WorkerPool,
    group_id: Option<i64>,
) -> Result<ClientSummary, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = SessionChannel::new(io);
    let mut summary = ClientSummary::default();

    loop {
        match channel.recv().await? {
            Some(Message::UrlAssignment { url }) => {
                info!("measuring {url}");
                let report = pool.dispatch(&url).await;
                if !report.failed.is_empty() {
                    warn!("{url}: no samples from {:?}", report.failed);
                }

                let mut samples = report.samples;
                for sample in &mut samples {
                    sample.group_id = group_id;
                }

                summary.assignments += 1;
                summary.samples += samples.len();

                channel.send(&Message::MeasurementBatch { samples }).await?;
                channel.send(&Message::Done).await?;
            }
            Some(Message::Exit) => {
                info!("server has no more work");
                break;
            }
            Some(other) => {
                return Err(ProtocolError::Unexpected {
                    expected: "url_assignment or exit",
                    received: other.kind(),
                });
            }
            None => {
                warn!("server closed the session");
                break;
            }
        }
    }

    Ok(summary)
}
