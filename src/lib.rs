// A TFTP server (RFC 1350) that serves every client from a single UDP socket.
//
// A transfer begins with a read request (RRQ) or write request (WRQ). Files move in blocks of 512
// bytes; each DATA packet must be acknowledged before the next one is sent, and a DATA packet
// shorter than 512 bytes ends the transfer. A read is answered with DATA block 1, a write with
// ACK 0.
//
// RFC 1350 has the server answer from a freshly chosen port per transfer. This server instead
// answers everything from the port it listens on and tells transfers apart by the client's
// source address and port alone, keeping one session per client in a table.
//
// On loss, the side waiting for a reply times out and resends the last packet it sent. The server
// keeps that packet on the session and resends it a bounded number of times before dropping the
// session. ERROR packets are sent once as a courtesy and never retransmitted or acknowledged.
//
// Error codes:
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user

pub mod config;
pub mod dispatch;
pub mod retransmit;
pub mod server;
pub mod session;
pub mod store;
pub mod table;
pub mod tftp;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use server::Server;
