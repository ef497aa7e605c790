// Per-client transfer state.
//
// A session is created when a read or write request is granted and lives until the transfer
// completes, fails, or the client stops answering. Read sessions send DATA and wait for ACKs;
// write sessions send ACKs and wait for DATA. A third, degenerate kind (`Aborted`) is recorded
// after a request was refused so that one trailing packet from that client is absorbed quietly.
//
// Sessions never touch the socket. Each transition returns a `ResultAction` that the dispatcher
// carries out.

use crate::retransmit::RetryState;
use crate::tftp::{self, ErrorCode, FileMode, Packet};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// The (address, port) pair a transfer is keyed on, i.e. the client's transfer ID.
pub type ClientKey = SocketAddr;

/// A sequentially readable byte stream owned by a read session.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// A sequentially appendable byte stream owned by a write session.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Represents an action that the dispatcher should take in response to a session transition.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Send the packet and await a response. The packet is kept for retransmission.
    SendPacketAndAwait(Packet),

    /// Nothing to send; the session is unchanged.
    Ignore,

    /// Send the packet and remove the session.
    TerminateWithPacket(Packet),

    /// Remove the session without sending anything, optionally logging a warning.
    CloseSession(Option<String>),
}

/// All the kinds of session the table can hold.
#[derive(Debug)]
pub enum TransferSession {
    Read(ReadSession),
    Write(WriteSession),
    Aborted(AbortedSession),
}

impl TransferSession {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferSession::Read(_) => "read",
            TransferSession::Write(_) => "write",
            TransferSession::Aborted(_) => "aborted",
        }
    }

    /// Remembers `packet` as the one to resend if no reply arrives by `deadline`.
    pub fn arm(&mut self, packet: &Packet, deadline: Instant) {
        match self {
            TransferSession::Read(s) => s.retry.arm(packet.to_bytes(), deadline),
            TransferSession::Write(s) => s.retry.arm(packet.to_bytes(), deadline),
            TransferSession::Aborted(_) => {}
        }
    }

    /// Releases whatever stream the session owns. A write session that did not finish still has
    /// its sink flushed so the bytes received so far land on disk.
    pub async fn close(self) {
        match self {
            TransferSession::Read(_) | TransferSession::Aborted(_) => {}
            TransferSession::Write(mut s) => {
                if !s.complete {
                    if let Err(e) = s.finish().await {
                        log::warn!("Failed to close sink for {}: {e}", s.client);
                    }
                }
            }
        }
    }
}

/// Serves a file to a client, one block per acknowledged DATA packet.
pub struct ReadSession {
    client: ClientKey,
    source: ByteSource,
    len: u64,
    mode: FileMode,
    block_size: usize,
    current_block: u16,
    complete: bool,
    retry: RetryState,
}

impl ReadSession {
    pub fn new(client: ClientKey, source: ByteSource, len: u64, mode: FileMode) -> ReadSession {
        ReadSession {
            client,
            source,
            len,
            mode,
            block_size: tftp::DATA_BUFFER_SIZE,
            current_block: 1,
            complete: false,
            retry: RetryState::default(),
        }
    }

    pub fn current_block(&self) -> u16 {
        self.current_block
    }

    /// True once the short block that ends the transfer has been sent.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub(crate) fn retry_mut(&mut self) -> &mut RetryState {
        &mut self.retry
    }

    /// A read transfer opens with DATA block 1.
    pub async fn first_packet(&mut self) -> ResultAction {
        self.send_current_block().await
    }

    pub async fn process_ack(&mut self, block: u16) -> ResultAction {
        match block {
            block if block == self.current_block => {
                if self.complete {
                    log::info!("Sent {} bytes to {} ({})", self.len, self.client, self.mode);
                    return ResultAction::CloseSession(None);
                }
                self.current_block = self.current_block.wrapping_add(1);
                self.send_current_block().await
            }
            block if block < self.current_block => {
                // Stale or duplicated ACK. The retransmit timer covers a lost DATA.
                ResultAction::Ignore
            }
            _ => ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: format!(
                    "Cannot acknowledge a block which was not yet sent. Server's current block is {cb}, but received an ack for {block}",
                    cb = self.current_block
                ),
            }),
        }
    }

    async fn send_current_block(&mut self) -> ResultAction {
        match read_block(&mut self.source, self.block_size).await {
            Ok(data) => {
                if data.len() < self.block_size {
                    self.complete = true;
                }
                ResultAction::SendPacketAndAwait(Packet::Data {
                    block: self.current_block,
                    data,
                })
            }
            Err(e) => ResultAction::TerminateWithPacket(Packet::Error {
                code: e.kind().into(),
                message: format!("Failed to read from file: {e}"),
            }),
        }
    }
}

impl fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadSession")
            .field("client", &self.client)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("current_block", &self.current_block)
            .field("complete", &self.complete)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Reads up to `block_size` bytes. A short result means the source is exhausted.
async fn read_block(source: &mut ByteSource, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at the end of the
    // source, so keep reading until the block is full or the source reports EOF.
    while cursor < buf.len() {
        match source.read(&mut buf[cursor..]).await? {
            0 => break,
            n => cursor += n,
        }
    }

    buf.truncate(cursor);
    Ok(buf)
}

/// Receives a file from a client, one acknowledged DATA packet at a time.
pub struct WriteSession {
    client: ClientKey,
    sink: ByteSink,
    mode: FileMode,
    block_size: usize,
    last_acked_block: u16,
    received: u64,
    complete: bool,
    retry: RetryState,
}

impl WriteSession {
    pub fn new(client: ClientKey, sink: ByteSink, mode: FileMode) -> WriteSession {
        WriteSession {
            client,
            sink,
            mode,
            block_size: tftp::DATA_BUFFER_SIZE,
            last_acked_block: 0,
            received: 0,
            complete: false,
            retry: RetryState::default(),
        }
    }

    pub fn last_acked_block(&self) -> u16 {
        self.last_acked_block
    }

    /// True once the short block that ends the transfer has been written.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub(crate) fn retry_mut(&mut self) -> &mut RetryState {
        &mut self.retry
    }

    /// A write transfer opens with ACK 0.
    pub fn first_packet(&mut self) -> ResultAction {
        ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 })
    }

    pub async fn process_data(&mut self, block: u16, data: &[u8]) -> ResultAction {
        match block {
            block if block == self.last_acked_block.wrapping_add(1) => {
                // A file sink only reports a failed write once it is flushed.
                if let Err(e) = self.append(data).await {
                    return ResultAction::TerminateWithPacket(Packet::Error {
                        code: ErrorCode::DiskFull,
                        message: format!("Error writing to file: {e}"),
                    });
                }
                self.last_acked_block = block;
                self.received += data.len() as u64;

                let ack = Packet::Ack { block };
                if data.len() < self.block_size {
                    self.complete = true;
                    if let Err(e) = self.finish().await {
                        return ResultAction::TerminateWithPacket(Packet::Error {
                            code: ErrorCode::DiskFull,
                            message: format!("Error closing file: {e}"),
                        });
                    }
                    log::info!("Received {} bytes from {} ({})", self.received, self.client, self.mode);
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            block if block <= self.last_acked_block => {
                // Duplicate of a block already written; the retransmit timer resends our ACK.
                ResultAction::Ignore
            }
            _ => ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: format!(
                    "Data blocks must be received by the server in sequence. Server received data for block {block}, \
                    but the server has only received up to block {cb}.",
                    cb = self.last_acked_block
                ),
            }),
        }
    }

    async fn append(&mut self, data: &[u8]) -> Result<(), io::Error> {
        self.sink.write_all(data).await?;
        self.sink.flush().await
    }

    async fn finish(&mut self) -> Result<(), io::Error> {
        self.sink.flush().await?;
        self.sink.shutdown().await
    }
}

impl fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WriteSession")
            .field("client", &self.client)
            .field("mode", &self.mode)
            .field("last_acked_block", &self.last_acked_block)
            .field("received", &self.received)
            .field("complete", &self.complete)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Tombstone left behind after a refused request.
#[derive(Debug)]
pub struct AbortedSession {
    expires: Instant,
}

impl AbortedSession {
    pub fn new(expires: Instant) -> AbortedSession {
        AbortedSession { expires }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires <= now
    }
}
