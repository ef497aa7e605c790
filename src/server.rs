// The server loop.
//
// One task owns the socket and the dispatcher. Each iteration waits a bounded time for a
// datagram, hands it to the dispatcher and sends back whatever reply comes out, then sweeps the
// session table for overdue retransmissions. Nothing else touches the session table, so every
// transition for a client happens strictly one after the other.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::tftp::{SocketError, TftpSocket};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Server {
    sock: TftpSocket,
    dispatcher: Dispatcher,
    poll_interval: Duration,
}

impl Server {
    pub fn bind(config: &ServerConfig) -> Result<Server, SocketError> {
        let sock = TftpSocket::bind(config.bind)?;
        Ok(Server {
            sock,
            dispatcher: Dispatcher::from_config(config),
            poll_interval: config.poll_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Serves clients until `shutdown` resolves, then releases every open session.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down");
                    break;
                }
                received = self.sock.recv_with_timeout(self.poll_interval) => match received {
                    Ok((buf, src)) => {
                        if let Some(reply) = self.dispatcher.handle(&buf, src).await {
                            log::debug!("Sending {reply} to {src}");
                            send(&self.sock, &reply.to_bytes(), src).await;
                        }
                    }
                    Err(SocketError::Timeout(_)) => {}
                    // Receive errors on a UDP socket (e.g. an ICMP port unreachable from a client
                    // that went away) only concern one peer.
                    Err(SocketError::IO(e)) => log::warn!("Receive failed: {e}"),
                },
            }

            for (dst, packet) in self.dispatcher.sweep(Instant::now()).await {
                send(&self.sock, &packet, dst).await;
            }
        }

        self.dispatcher.shutdown().await;
    }
}

/// Outbound packets are best effort; a failed send is left to the retransmit timer.
async fn send(sock: &TftpSocket, packet: &[u8], dst: SocketAddr) {
    if let Err(e) = sock.send(packet, dst).await {
        log::warn!("Unable to send packet to {dst}: {e}");
    }
}
