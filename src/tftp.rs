// Wire format for RFC 1350 packets, plus the UDP socket the server listens on.
//
// Every packet starts with a 2-byte big-endian opcode:
//
//  RRQ/WRQ: 0x01/0x02 | Filename | 0x00 | Mode | 0x00
//  DATA:    0x03 | Block # (2 bytes) | Data (0-512 bytes)
//  ACK:     0x04 | Block # (2 bytes)
//  ERROR:   0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// A DATA packet shorter than 512 bytes marks the end of a transfer.

use async_io::Async;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Maximum payload of a single DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram the server accepts. Anything bigger than a full DATA packet is read whole so
/// that it can be rejected instead of silently truncated.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Reasons a datagram could not be decoded into a [`Packet`].
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("request is not NUL-terminated")]
    Unterminated,

    #[error("request must contain a filename and a mode, found {0} field(s)")]
    FieldCount(usize),

    #[error("unknown transfer mode '{0}'")]
    UnknownMode(String),

    #[error("data payload of {0} bytes exceeds the 512 byte block size")]
    OversizedData(usize),
}

/// Represents an error returned from the TFTP socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("socket receive timed out")]
    Timeout(#[from] Elapsed),
}

type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write. Both modes move the bytes
/// untouched; the mode is only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

impl FromStr for FileMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            _ => Err(ParseError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    /// Unknown codes are reported as `Undefined`.
    pub fn from_u16(code: u16) -> ErrorCode {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined.",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq { path: String, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

/// TFTP opcodes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    fn from_u16(raw: u16) -> Result<OpCode, ParseError> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => Err(ParseError::UnknownOpcode(raw)),
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Returns the bytes up to the first NUL (or the whole buffer, if there is none) as a string.
fn string_from_buffer(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Splits a request body into its filename and mode. The body must be exactly two NUL-terminated
/// fields.
fn parse_path_and_mode(body: &[u8]) -> Result<(String, FileMode), ParseError> {
    let fields: Vec<&[u8]> = match body.strip_suffix(&[0]) {
        Some(rest) => rest.split(|&b| b == 0).collect(),
        None => return Err(ParseError::Unterminated),
    };

    if fields.len() != 2 {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let path = String::from_utf8_lossy(fields[0]).into_owned();
    let mode = String::from_utf8_lossy(fields[1]).parse()?;
    Ok((path, mode))
}

impl Packet {
    /// Decodes a raw datagram.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, ParseError> {
        if buf.len() < 4 {
            return Err(ParseError::TooShort(buf.len()));
        }

        match OpCode::from_u16(u16_from_buffer(&buf[..2]))? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => {
                let data = &buf[4..];
                if data.len() > DATA_BUFFER_SIZE {
                    return Err(ParseError::OversizedData(data.len()));
                }
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    data: data.to_vec(),
                })
            }
            OpCode::Ack => Ok(Packet::Ack {
                block: u16_from_buffer(&buf[2..4]),
            }),
            OpCode::Error => Ok(Packet::Error {
                code: ErrorCode::from_u16(u16_from_buffer(&buf[2..4])),
                message: string_from_buffer(&buf[4..]),
            }),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + DATA_BUFFER_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }

        buf
    }

    /// Builds an error packet carrying the code's stock message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error {
            code,
            message: code.default_message().to_string(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path, mode } => write!(f, "RRQ '{path}' ({mode})"),
            Packet::WriteReq { path, mode } => write!(f, "WRQ '{path}' ({mode})"),
            Packet::Data { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Packet::Ack { block } => write!(f, "ACK #{block}"),
            Packet::Error { code, message } => {
                write!(f, "ERROR {} ({:?}): '{message}'", code.as_u16(), code)
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around the server's UDP socket. Decoding is left to the caller so that malformed
/// datagrams can still be answered.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits at most `ttl` for a datagram.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        buf.truncate(total_written);
        Ok((buf, src))
    }

    pub async fn send(&self, packet: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(packet, dst).await?;
        Ok(())
    }
}

impl fmt::Debug for TftpSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TftpSocket")
            .field("local_addr", &self.sock.get_ref().local_addr().ok())
            .finish()
    }
}
