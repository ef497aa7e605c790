// This module routes every datagram the server receives to the transfer it belongs to.
//
// Clients are told apart only by their source address and port. A read or write request always
// starts a fresh session for that key (replacing whatever was there), while DATA, ACK and ERROR
// packets act on the session already stored for it. Each call to `handle` produces at most one
// reply; retransmissions come from `sweep`.

use crate::config::ServerConfig;
use crate::retransmit::{self, RetransmitPolicy};
use crate::session::{AbortedSession, ClientKey, ReadSession, ResultAction, TransferSession, WriteSession};
use crate::store::FileStore;
use crate::table::SessionTable;
use crate::tftp::{ErrorCode, FileMode, Packet};
use tokio::time::Instant;

const DEFAULT_MAX_SESSIONS: usize = 1024;

#[derive(Debug)]
pub struct Dispatcher {
    store: FileStore,
    sessions: SessionTable,
    policy: RetransmitPolicy,
    max_sessions: usize,
}

impl Dispatcher {
    pub fn new(store: FileStore, policy: RetransmitPolicy) -> Dispatcher {
        Dispatcher {
            store,
            sessions: SessionTable::new(),
            policy,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Dispatcher {
        Dispatcher::new(config.file_store(), config.retransmit_policy()).with_max_sessions(config.max_sessions)
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Dispatcher {
        self.max_sessions = max_sessions;
        self
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Processes one datagram from `src` and returns the reply to send back, if any.
    pub async fn handle(&mut self, buf: &[u8], src: ClientKey) -> Option<Packet> {
        let packet = match Packet::parse_from_buf(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Malformed packet from {src}: {e}");
                return Some(Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: format!("Error parsing incoming packet: {e}"),
                });
            }
        };

        log::debug!("Got {packet} from {src}");
        let now = Instant::now();
        match packet {
            Packet::ReadReq { path, mode } => self.start_read(src, &path, mode, now).await,
            Packet::WriteReq { path, mode } => self.start_write(src, &path, mode, now).await,
            Packet::Data { block, data } => self.on_data(src, block, &data, now).await,
            Packet::Ack { block } => self.on_ack(src, block, now).await,
            Packet::Error { code, message } => {
                // Never answer an error with an error.
                if self.sessions.discard(&src).await {
                    log::warn!("Client {src} aborted its transfer: {code:?}, message: '{message}'");
                }
                None
            }
        }
    }

    /// Resends overdue packets and drops sessions whose client stopped answering.
    pub async fn sweep(&mut self, now: Instant) -> Vec<(ClientKey, Vec<u8>)> {
        retransmit::sweep(&mut self.sessions, now, &self.policy).await
    }

    /// Releases every session.
    pub async fn shutdown(&mut self) {
        if !self.sessions.is_empty() {
            log::info!("Dropping {} open session(s)", self.sessions.len());
        }
        self.sessions.clear().await;
    }

    fn at_capacity(&self, src: &ClientKey) -> bool {
        !self.sessions.contains(src) && self.sessions.len() >= self.max_sessions
    }

    fn busy() -> Packet {
        Packet::Error {
            code: ErrorCode::Undefined,
            message: "Server busy, try again later".to_string(),
        }
    }

    async fn start_read(&mut self, src: ClientKey, path: &str, mode: FileMode, now: Instant) -> Option<Packet> {
        if self.at_capacity(&src) {
            log::warn!("Refusing read of '{path}' from {src}: session limit reached");
            return Some(Self::busy());
        }

        // The client gave up on whatever it had going; its stream must be released before the same
        // file is opened again.
        self.sessions.discard(&src).await;

        match self.store.open_read(path, mode).await {
            Ok(source) => {
                log::info!("Starting read of '{path}' for {src}");
                let mut session = ReadSession::new(src, source.reader, source.len, mode);
                let action = session.first_packet().await;
                self.install(src, TransferSession::Read(session), action, now).await
            }
            Err(e) => {
                log::warn!("Refusing read of '{path}' from {src}: {e}");
                self.refuse(src, e.read_error_code(), now).await
            }
        }
    }

    async fn start_write(&mut self, src: ClientKey, path: &str, mode: FileMode, now: Instant) -> Option<Packet> {
        if self.at_capacity(&src) {
            log::warn!("Refusing write of '{path}' from {src}: session limit reached");
            return Some(Self::busy());
        }

        self.sessions.discard(&src).await;

        match self.store.open_write(path, mode).await {
            Ok(sink) => {
                log::info!("Starting write of '{path}' for {src}");
                let mut session = WriteSession::new(src, sink, mode);
                let action = session.first_packet();
                self.install(src, TransferSession::Write(session), action, now).await
            }
            Err(e) => {
                log::warn!("Refusing write of '{path}' from {src}: {e}");
                self.refuse(src, e.write_error_code(), now).await
            }
        }
    }

    /// Answers a request that could not be granted. A tombstone replaces any session the client
    /// had so that its next packet is swallowed instead of drawing an unknown-TID error.
    async fn refuse(&mut self, src: ClientKey, code: ErrorCode, now: Instant) -> Option<Packet> {
        let tombstone = AbortedSession::new(now + self.policy.give_up_after());
        self.sessions.insert(src, TransferSession::Aborted(tombstone)).await;
        Some(Packet::error(code))
    }

    /// Stores a freshly created session according to what its opening move produced.
    async fn install(
        &mut self,
        src: ClientKey,
        mut session: TransferSession,
        action: ResultAction,
        now: Instant,
    ) -> Option<Packet> {
        match action {
            ResultAction::SendPacketAndAwait(packet) => {
                session.arm(&packet, now + self.policy.timeout);
                self.sessions.insert(src, session).await;
                Some(packet)
            }
            ResultAction::TerminateWithPacket(packet) => {
                log::warn!("Transfer with {src} failed before it started: {packet}");
                session.close().await;
                let tombstone = AbortedSession::new(now + self.policy.give_up_after());
                self.sessions.insert(src, TransferSession::Aborted(tombstone)).await;
                Some(packet)
            }
            ResultAction::Ignore | ResultAction::CloseSession(_) => {
                session.close().await;
                self.sessions.discard(&src).await;
                None
            }
        }
    }

    async fn on_data(&mut self, src: ClientKey, block: u16, data: &[u8], now: Instant) -> Option<Packet> {
        let action = match self.sessions.lookup_mut(&src) {
            None => return Some(unknown_transfer(src)),
            Some(TransferSession::Aborted(_)) => {
                self.sessions.remove(&src);
                return None;
            }
            Some(TransferSession::Read(_)) => {
                return Some(Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: "Expected to receive an Ack packet, but got a Data packet instead".to_string(),
                });
            }
            Some(TransferSession::Write(session)) => session.process_data(block, data).await,
        };
        self.apply(src, action, now).await
    }

    async fn on_ack(&mut self, src: ClientKey, block: u16, now: Instant) -> Option<Packet> {
        let action = match self.sessions.lookup_mut(&src) {
            None => return Some(unknown_transfer(src)),
            Some(TransferSession::Aborted(_)) => {
                self.sessions.remove(&src);
                return None;
            }
            Some(TransferSession::Write(_)) => {
                return Some(Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: "Expected to receive a Data packet, but got an Ack packet instead".to_string(),
                });
            }
            Some(TransferSession::Read(session)) => session.process_ack(block).await,
        };
        self.apply(src, action, now).await
    }

    /// Carries out the outcome of a transition on the session stored for `src`.
    async fn apply(&mut self, src: ClientKey, action: ResultAction, now: Instant) -> Option<Packet> {
        match action {
            ResultAction::SendPacketAndAwait(packet) => {
                if let Some(session) = self.sessions.lookup_mut(&src) {
                    session.arm(&packet, now + self.policy.timeout);
                }
                Some(packet)
            }
            ResultAction::Ignore => {
                log::debug!("Ignoring duplicate packet from {src}");
                None
            }
            ResultAction::TerminateWithPacket(packet) => {
                match packet {
                    Packet::Error { .. } => log::warn!("Aborting transfer with {src}: {packet}"),
                    _ => log::debug!("Transfer from {src} complete"),
                }
                self.sessions.discard(&src).await;
                Some(packet)
            }
            ResultAction::CloseSession(reason) => {
                match reason {
                    Some(msg) => log::warn!("Closing session with {src}: {msg}"),
                    None => log::debug!("Transfer to {src} complete"),
                }
                self.sessions.discard(&src).await;
                None
            }
        }
    }
}

fn unknown_transfer(src: ClientKey) -> Packet {
    log::debug!("No transfer in progress for {src}");
    Packet::error(ErrorCode::UnknownTransferId)
}
