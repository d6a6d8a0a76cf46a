use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};
use crate::wire::WireMessage;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Send failures are logged and otherwise treated like packet loss: recovery happens through
///  NACK retries. The return value only tells whether the datagram was handed to the network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool {
        trace!("UDP socket: sending packet to {:?}", to);

        match self.send_to(packet_buf, to).await {
            Ok(_) => true,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                false
            }
        }
    }
}

pub async fn send_message(socket: &dyn SendSocket, to: SocketAddr, msg: &WireMessage) -> bool {
    socket.do_send_packet(to, msg.to_bytes().as_ref()).await
}
