//! Forwarding of questions to upstream nameservers over UDP.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use udns_types::protocol::deserialise::{decode_response, DecodeError};
use udns_types::protocol::serialise::{encode_query, EncodeError, MAX_UDP_PAYLOAD};
use udns_types::protocol::types::{DnsResponse, Name, Question, RecordClass, RecordType};

use crate::context::Context;

/// The per-attempt timeout when the request carries no deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The budget for the health probe.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// The known-good name resolved by the health probe.
const HEALTH_PROBE_NAME: &str = "cloudflare.com.";

/// An ordered pool of upstream nameservers.
///
/// A resolve tries each server once, in configured order, and returns
/// the first success.  Each attempt gets the remaining deadline
/// budget (or the default timeout) and its own ephemeral socket;
/// there is no shared state and no adaptive reordering.
#[derive(Debug, Clone)]
pub struct Forwarder {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self::with_timeout(servers, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Forward the question and return the first validated response.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the context deadline passes before or between
    /// attempts; `AllServersFailed` (carrying the last underlying
    /// cause) when every server fails; `NoServersConfigured` when
    /// there is nothing to try.
    pub async fn resolve(
        &self,
        ctx: &Context,
        question: &Question,
    ) -> Result<DnsResponse, ResolveError> {
        if self.servers.is_empty() {
            return Err(ResolveError::NoServersConfigured);
        }

        let mut last_error = None;

        for server in &self.servers {
            if ctx.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }

            let budget = ctx.budget(self.timeout);
            match timeout(budget, exchange(*server, question)).await {
                Ok(Ok(response)) => {
                    tracing::trace!(%server, %question, "upstream HIT");
                    return Ok(response);
                }
                Ok(Err(error)) => {
                    tracing::debug!(%server, %question, %error, "upstream attempt failed");
                    last_error = Some(error);
                }
                Err(_) => {
                    tracing::debug!(%server, %question, "upstream attempt timed out");
                    last_error = Some(ResolveError::Timeout { server: *server });
                }
            }
        }

        // the loop ran at least once, so there is a last error
        Err(ResolveError::AllServersFailed {
            last: Box::new(last_error.expect("no servers tried")),
        })
    }

    /// Resolve a known-good name within a short budget, as a
    /// pass/fail liveness probe of the configured servers.
    pub async fn health(&self) -> bool {
        let question = Question {
            id: 1,
            name: Name::canonicalise(HEALTH_PROBE_NAME).expect("probe name is valid"),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
        };
        let ctx = Context::with_timeout(HEALTH_TIMEOUT);

        self.resolve(&ctx, &question).await.is_ok()
    }
}

/// One attempt against one server: connect, send the encoded
/// question as a single datagram, receive into a 512-octet buffer,
/// and decode against the question's ID.  The socket closes on drop.
async fn exchange(server: SocketAddr, question: &Question) -> Result<DnsResponse, ResolveError> {
    let octets = encode_query(question)?;

    let sock = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|error| ResolveError::Io { server, error })?;
    sock.connect(server)
        .await
        .map_err(|error| ResolveError::Io { server, error })?;
    sock.send(&octets)
        .await
        .map_err(|error| ResolveError::Io { server, error })?;

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let received = sock
        .recv(&mut buf)
        .await
        .map_err(|error| ResolveError::Io { server, error })?;

    Ok(decode_response(&buf[..received], question.id)?)
}

/// An error that can occur when forwarding a question upstream.
#[derive(Debug)]
pub enum ResolveError {
    /// The forwarder has an empty server list.
    NoServersConfigured,

    /// The question could not be serialised.
    Encode(EncodeError),

    /// The response could not be parsed, or did not answer the
    /// question (wrong ID).
    Decode(DecodeError),

    /// A socket operation failed.
    Io { server: SocketAddr, error: io::Error },

    /// One attempt ran out its budget.
    Timeout { server: SocketAddr },

    /// The request deadline passed before an attempt could be made.
    Cancelled,

    /// Every configured server failed; the last underlying cause is
    /// attached.
    AllServersFailed { last: Box<ResolveError> },
}

impl From<EncodeError> for ResolveError {
    fn from(error: EncodeError) -> Self {
        ResolveError::Encode(error)
    }
}

impl From<DecodeError> for ResolveError {
    fn from(error: DecodeError) -> Self {
        ResolveError::Decode(error)
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolveError::NoServersConfigured => write!(f, "no upstream servers configured"),
            ResolveError::Encode(error) => write!(f, "could not serialise question: {error}"),
            ResolveError::Decode(error) => write!(f, "could not parse response: {error}"),
            ResolveError::Io { server, error } => write!(f, "I/O error against {server}: {error}"),
            ResolveError::Timeout { server } => write!(f, "attempt against {server} timed out"),
            ResolveError::Cancelled => write!(f, "request deadline passed"),
            ResolveError::AllServersFailed { last } => {
                write!(f, "every upstream server failed, last error: {last}")
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Encode(error) => Some(error),
            ResolveError::Decode(error) => Some(error),
            ResolveError::Io { error, .. } => Some(error),
            ResolveError::AllServersFailed { last } => Some(last),
            _ => None,
        }
    }
}
