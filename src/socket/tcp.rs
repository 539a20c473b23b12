use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::address::SocketAddress;
use crate::error::{ProxyError, ProxyResult};
use crate::message::payloads::Data;
use crate::message::Content;
use crate::provider::provider::Provider;
use crate::socket::proxy_socket::ProxySocket;
use crate::socket_info::{SocketFlags, SocketInfo, SocketOption};

/// A stream socket through a proxy. A connecting socket uses the first proxy that links, a
///  listening socket links through all of them.
pub struct TcpProxySocket {
    socket: ProxySocket,
    /// remainder of a data message that did not fit the caller's buffer
    read_buffer: Mutex<Bytes>,
}

impl TcpProxySocket {
    pub fn new(provider: Arc<Provider>) -> TcpProxySocket {
        TcpProxySocket {
            socket: ProxySocket::new(provider, SocketInfo::tcp(SocketAddress::Unspecified)),
            read_buffer: Mutex::new(Bytes::new()),
        }
    }

    pub fn socket(&self) -> &ProxySocket {
        &self.socket
    }

    pub async fn connect(&self, address: SocketAddress) -> ProxyResult<()> {
        debug!("connecting to {}", address);
        self.socket.update_info(|info| info.address = address.clone()).await;

        let connect_timeout = self.socket.provider().config.connect_timeout;
        match timeout(connect_timeout, self.socket.link_one()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ProxyError::NotLinked(format!("no proxy could connect to {}", address))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::timeout(format!("connecting to {}", address))),
        }
    }

    pub async fn listen(&self, address: SocketAddress) -> ProxyResult<()> {
        debug!("listening on {}", address);
        self.socket.update_info(|info| {
            info.address = address.clone();
            info.flags |= SocketFlags::PASSIVE;
        }).await;

        let listen_timeout = self.socket.provider().config.listen_timeout;
        match timeout(listen_timeout, self.socket.link_all()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ProxyError::NotLinked(format!("no proxy could listen on {}", address))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::timeout(format!("listening on {}", address))),
        }
    }

    pub async fn send(&self, buf: &[u8]) -> ProxyResult<usize> {
        let send_timeout = self.socket.provider().config.send_timeout;
        timeout(send_timeout, self.socket.send(Data::new(Bytes::copy_from_slice(buf)))).await??;
        Ok(buf.len())
    }

    /// Reads data into `buf`, returning the number of bytes read. Data that does not fit is
    ///  returned by subsequent reads. `0` means that the socket was closed.
    ///
    /// Data that arrived after a gap in the stream is reported as an error first, and it is
    ///  returned by the next read.
    pub async fn receive(&self, buf: &mut [u8]) -> ProxyResult<usize> {
        let mut read_buffer = self.read_buffer.lock().await;

        while read_buffer.is_empty() {
            let receive_timeout = self.socket.provider().config.receive_timeout;
            let message = match timeout(receive_timeout, self.socket.receive()).await? {
                Ok(message) => message,
                Err(ProxyError::Closed) => return Ok(0),
                Err(e) => return Err(e),
            };

            let error = message.socket_error();
            if let Content::Data(data) = message.content {
                *read_buffer = data.payload;
            }
            if !error.is_success() {
                return Err(ProxyError::Remote(error));
            }
        }

        let len = buf.len().min(read_buffer.len());
        buf[..len].copy_from_slice(&read_buffer[..len]);
        read_buffer.advance(len);
        Ok(len)
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

    pub async fn peer_address(&self) -> SocketAddress {
        self.socket.peer_address().await
    }

    pub async fn close(&self) -> ProxyResult<()> {
        let close_timeout = self.socket.provider().config.close_timeout;
        timeout(close_timeout, self.socket.close()).await?
    }
}
