// Timeout-driven retransmission.
//
// Every DATA or ACK the server sends that expects a reply is remembered on its session together
// with a deadline. The server loop sweeps the session table once per iteration: a session whose
// deadline has passed gets its last packet resent, until it has been resent `max_retries` times.
// The expiry after that abandons the session without sending anything; the client will time out
// on its own.

use crate::session::{ClientKey, TransferSession};
use crate::table::SessionTable;
use std::time::Duration;
use tokio::time::Instant;

/// How long to wait for a reply and how many times to resend before giving up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetransmitPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        RetransmitPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

impl RetransmitPolicy {
    /// Time after which a session that never makes progress is abandoned.
    pub fn give_up_after(&self) -> Duration {
        self.timeout * (self.max_retries + 1)
    }
}

/// What the sweep decided for one expired session.
#[derive(Debug, PartialEq)]
pub enum Expiry {
    Resend(Vec<u8>),
    Abandon,
}

/// The last packet a session sent, when it expires, and how often it has been resent.
#[derive(Debug, Default)]
pub struct RetryState {
    last_sent: Vec<u8>,
    deadline: Option<Instant>,
    retries: u32,
}

impl RetryState {
    /// Records a freshly sent packet. Sending a new packet is forward progress, so the retry count
    /// starts over.
    pub fn arm(&mut self, packet: Vec<u8>, deadline: Instant) {
        self.last_sent = packet;
        self.deadline = Some(deadline);
        self.retries = 0;
    }

    pub fn last_sent(&self) -> &[u8] {
        &self.last_sent
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn poll(&mut self, now: Instant, policy: &RetransmitPolicy) -> Option<Expiry> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                if self.retries >= policy.max_retries {
                    self.deadline = None;
                    return Some(Expiry::Abandon);
                }
                self.retries += 1;
                self.deadline = Some(now + policy.timeout);
                Some(Expiry::Resend(self.last_sent.clone()))
            }
            _ => None,
        }
    }
}

/// Resends overdue packets and drops sessions that ran out of retries (and stale tombstones).
/// Returns the datagrams to put back on the wire.
pub async fn sweep(
    table: &mut SessionTable,
    now: Instant,
    policy: &RetransmitPolicy,
) -> Vec<(ClientKey, Vec<u8>)> {
    let mut resend = Vec::new();
    let mut abandoned = Vec::new();

    for (key, session) in table.iter_mut() {
        let expiry = match session {
            TransferSession::Read(s) => s.retry_mut().poll(now, policy),
            TransferSession::Write(s) => s.retry_mut().poll(now, policy),
            TransferSession::Aborted(s) => s.is_expired(now).then_some(Expiry::Abandon),
        };

        match expiry {
            Some(Expiry::Resend(packet)) => {
                log::debug!("Retransmitting to {key} after timeout");
                resend.push((*key, packet));
            }
            Some(Expiry::Abandon) => abandoned.push(*key),
            None => {}
        }
    }

    for key in abandoned {
        if let Some(session) = table.remove(&key) {
            if !matches!(session, TransferSession::Aborted(_)) {
                log::warn!("Giving up on {} session with {key}: no reply after {} retries", session.kind(), policy.max_retries);
            }
            session.close().await;
        }
    }

    resend
}
