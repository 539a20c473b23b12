use std::sync::Arc;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::address::SocketAddress;
use crate::error::{ProxyError, ProxyResult};
use crate::message::payloads::Data;
use crate::message::Content;
use crate::provider::provider::Provider;
use crate::socket::proxy_socket::ProxySocket;
use crate::socket_info::{SocketInfo, SocketOption};

/// A datagram socket through all proxies that accept it
pub struct UdpProxySocket {
    socket: ProxySocket,
}

impl UdpProxySocket {
    pub fn new(provider: Arc<Provider>) -> UdpProxySocket {
        UdpProxySocket {
            socket: ProxySocket::new(provider, SocketInfo::udp(SocketAddress::Unspecified)),
        }
    }

    pub fn socket(&self) -> &ProxySocket {
        &self.socket
    }

    async fn link_all_within(&self, deadline: std::time::Duration, what: &str, address: &SocketAddress) -> ProxyResult<()> {
        match timeout(deadline, self.socket.link_all()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ProxyError::NotLinked(format!("no proxy could {} {}", what, address))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::timeout(format!("{} {}", what, address))),
        }
    }

    pub async fn bind(&self, address: SocketAddress) -> ProxyResult<()> {
        debug!("binding to {}", address);
        self.socket.update_info(|info| info.address = address.clone()).await;
        let bind_timeout = self.socket.provider().config.bind_timeout;
        self.link_all_within(bind_timeout, "bind", &address).await
    }

    /// Sets the default destination. The proxies filter received datagrams for this peer.
    pub async fn connect(&self, address: SocketAddress) -> ProxyResult<()> {
        debug!("connecting to {}", address);
        self.socket.update_info(|info| info.address = address.clone()).await;
        let connect_timeout = self.socket.provider().config.connect_timeout;
        self.link_all_within(connect_timeout, "connect to", &address).await
    }

    /// Sends a datagram to the default destination of a connected socket
    pub async fn send(&self, buf: &[u8]) -> ProxyResult<usize> {
        self.send_to(buf, SocketAddress::Unspecified).await
    }

    pub async fn send_to(&self, buf: &[u8], address: SocketAddress) -> ProxyResult<usize> {
        trace!("sending {} bytes to {}", buf.len(), address);
        let data = Data {
            source_address: address,
            ..Data::new(Bytes::copy_from_slice(buf))
        };

        let send_timeout = self.socket.provider().config.send_timeout;
        timeout(send_timeout, self.socket.send(data)).await??;
        Ok(buf.len())
    }

    /// Receives the next datagram and the address it came from
    pub async fn receive_from(&self) -> ProxyResult<(Bytes, SocketAddress)> {
        let receive_timeout = self.socket.provider().config.receive_timeout;
        let message = timeout(receive_timeout, self.socket.receive()).await??;

        if !message.is_success() {
            return Err(ProxyError::Remote(message.socket_error()));
        }
        match message.content {
            Content::Data(data) => Ok((data.payload, data.source_address)),
            other => Err(ProxyError::protocol(format!("expected data, received {:?}", other.kind()))),
        }
    }

    pub async fn set_option(&self, option: SocketOption, value: u64) -> ProxyResult<()> {
        self.socket.set_option(option, value).await
    }

    pub async fn get_option(&self, option: SocketOption) -> ProxyResult<u64> {
        self.socket.get_option(option).await
    }

    pub async fn local_address(&self) -> SocketAddress {
        self.socket.local_address().await
    }

    pub async fn close(&self) -> ProxyResult<()> {
        let close_timeout = self.socket.provider().config.close_timeout;
        timeout(close_timeout, self.socket.close()).await?
    }
}
