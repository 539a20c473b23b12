use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::address::SocketAddress;
use crate::error::{ProxyError, ProxyResult};
use crate::message::content::ContentKind;
use crate::message::payloads::{CloseResponse, Data, GetOpt, Link, Open, SetOpt};
use crate::message::{Content, Message};
use crate::provider::name_service::NameRecord;
use crate::provider::provider::Provider;
use crate::provider::stream_service::Connection;
use crate::reference::Reference;
use crate::socket_info::{SocketInfo, SocketOption, SocketOptionValue};
use crate::stream::multiplexer::LinkStream;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Unlinked,
    Linking,
    Linked,
    Opening,
    Open,
    Closing,
    Closed,
}

/// A socket's link through one proxy.
///
/// Linking is a control channel handshake (`Link` / `LinkResponse`) in which the proxy creates
///  its side of the socket and assigns the link's `remote_id`. Opening then creates a stream
///  connection, tells the proxy about it (`Open`) and starts the [LinkStream] over it. Data only
///  flows over the stream, options and the final unlink go over the control channel.
///
/// There are no retries in here: a failed step fails the link, and it is up to the socket to
///  use other links or give up.
pub struct ProxyLink {
    provider: Arc<Provider>,
    proxy: NameRecord,
    socket_id: Reference,
    remote_id: Reference,
    local_address: SocketAddress,
    peer_address: SocketAddress,
    stream: LinkStream,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    state: RwLock<LinkState>,
    /// set by a `close` while the link is opening, the open then closes the link when it is done
    close_requested: AtomicBool,
    opened_at: RwLock<Option<Instant>>,
}

impl ProxyLink {
    /// Performs the link handshake with a single proxy. Any failure (including a timeout or a
    ///  non-success response) fails this proxy only, it is returned rather than retried.
    #[instrument(level = "debug", skip_all, fields(proxy = %proxy.address, socket = %socket_id))]
    pub async fn link(provider: Arc<Provider>, socket_id: Reference, socket_info: &SocketInfo, proxy: NameRecord) -> ProxyResult<ProxyLink> {
        debug!("linking through proxy {} ({})", proxy.name, proxy.address);

        let link_timeout = provider.config.link_timeout;
        let request = Message::new(socket_id, Reference::NULL, Content::Link(Link::new(socket_info.clone())))
            .with_proxy(proxy.address);

        let response = Self::call(&provider, &proxy, request, link_timeout, "link").await?;
        let link_response = match response.content {
            Content::LinkResponse(r) if !r.link_id.is_null() => r,
            Content::LinkResponse(_) => return Err(ProxyError::protocol("link response without link id")),
            other => return Err(ProxyError::protocol(format!("expected link response, was {:?}", other.kind()))),
        };

        info!("linked through proxy {}: remote id {}", proxy.address, link_response.link_id);
        let stream = LinkStream::new(Reference::new_random(), link_response.link_id, provider.config.clone());
        Ok(ProxyLink {
            provider,
            proxy,
            socket_id,
            remote_id: link_response.link_id,
            local_address: link_response.local_address,
            peer_address: link_response.peer_address,
            stream,
            connection: RwLock::new(None),
            state: RwLock::new(LinkState::Linked),
            close_requested: AtomicBool::new(false),
            opened_at: RwLock::new(None),
        })
    }

    /// control channel round trip, mapping everything except a success response to an error
    async fn call(provider: &Provider, proxy: &NameRecord, request: Message, deadline: Duration, what: &str) -> ProxyResult<Message> {
        let response = match timeout(deadline, provider.remoting.call(proxy, request, deadline)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("{} request to proxy {} failed: {}", what, proxy.address, e);
                return Err(ProxyError::Transport(e));
            }
            Err(_) => {
                debug!("{} request to proxy {} timed out after {:?}", what, proxy.address, deadline);
                return Err(ProxyError::timeout(format!("{} through proxy {}", what, proxy.address)));
            }
        };

        if !response.is_success() {
            debug!("proxy {} rejected {} request: {:?}", proxy.address, what, response.socket_error());
            return Err(ProxyError::Remote(response.socket_error()));
        }
        Ok(response)
    }

    pub fn proxy(&self) -> &NameRecord {
        &self.proxy
    }

    pub fn remote_id(&self) -> Reference {
        self.remote_id
    }

    pub fn stream_id(&self) -> Reference {
        self.stream.stream_id()
    }

    pub fn local_address(&self) -> &SocketAddress {
        &self.local_address
    }

    pub fn peer_address(&self) -> &SocketAddress {
        &self.peer_address
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Opens the link's stream. Failure or timeout leaves the link closed.
    #[instrument(level = "debug", skip_all, fields(proxy = %self.proxy.address, link = %self.remote_id))]
    pub async fn open(&self) -> ProxyResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != LinkState::Linked {
                return Err(ProxyError::protocol(format!("cannot open a link in state {:?}", *state)));
            }
            *state = LinkState::Opening;
        }

        let open_timeout = self.provider.config.open_timeout;
        let result = match timeout(open_timeout, self.do_open()).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::timeout(format!("opening link through proxy {}", self.proxy.address))),
        };

        let result = match result {
            Ok(()) => {
                let mut state = self.state.write().await;
                if self.close_requested.load(Ordering::Acquire) {
                    Err(ProxyError::Closed)
                }
                else {
                    *self.opened_at.write().await = Some(Instant::now());
                    *state = LinkState::Open;
                    info!("link {} through proxy {} is open", self.remote_id, self.proxy.address);
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                info!("opening link {} through proxy {} failed: {}", self.remote_id, self.proxy.address, e);
                {
                    // the partial link is closed from the Linked state
                    *self.state.write().await = LinkState::Linked;
                }
                if let Err(close_error) = self.close().await {
                    debug!("closing the partially opened link failed as well: {}", close_error);
                }
                Err(e)
            }
        }
    }

    async fn do_open(&self) -> ProxyResult<()> {
        let connection = self.provider.stream_service
            .create_connection(self.stream.stream_id(), self.remote_id, &self.proxy).await?;
        *self.connection.write().await = Some(connection.clone());

        let request = Message::new(self.socket_id, self.remote_id, Content::Open(Open {
            stream_id: self.stream.stream_id(),
            stream_type: self.provider.config.stream_type.clone(),
            connection_string: connection.connection_string(),
            is_polled: connection.is_polled(),
            max_receive_buffer: self.provider.config.max_receive_buffer,
        })).with_proxy(self.proxy.address);

        let response = Self::call(&self.provider, &self.proxy, request, self.provider.config.open_timeout, "open").await?;
        if response.content.kind() != ContentKind::OpenResponse {
            return Err(ProxyError::protocol(format!("expected open response, was {:?}", response.content.kind())));
        }

        let transport = connection.open().await?;
        self.stream.attach(transport).await?;
        Ok(())
    }

    async fn ensure_open(&self) -> ProxyResult<()> {
        match *self.state.read().await {
            LinkState::Open => Ok(()),
            LinkState::Closing | LinkState::Closed => Err(ProxyError::Closed),
            other => Err(ProxyError::NotLinked(format!("link {} is {:?}", self.remote_id, other))),
        }
    }

    pub async fn send(&self, data: Data) -> ProxyResult<()> {
        self.ensure_open().await?;
        trace!("sending {} bytes through link {}", data.payload.len(), self.remote_id);
        self.stream.send(Content::Data(data)).await?;
        Ok(())
    }

    /// The next message received on the link's stream, `None` if the stream has ended
    pub async fn receive(&self) -> Option<Message> {
        self.stream.receive().await
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.stream.try_receive()
    }

    pub async fn set_option(&self, option_value: SocketOptionValue) -> ProxyResult<()> {
        let request = Message::new(self.socket_id, self.remote_id, Content::SetOpt(SetOpt { option_value }))
            .with_proxy(self.proxy.address);
        let response = Self::call(&self.provider, &self.proxy, request, self.provider.config.send_timeout, "set option").await?;
        match response.content {
            Content::SetOptResponse => Ok(()),
            other => Err(ProxyError::protocol(format!("expected set option response, was {:?}", other.kind()))),
        }
    }

    pub async fn get_option(&self, option: SocketOption) -> ProxyResult<u64> {
        let request = Message::new(self.socket_id, self.remote_id, Content::GetOpt(GetOpt { option }))
            .with_proxy(self.proxy.address);
        let response = Self::call(&self.provider, &self.proxy, request, self.provider.config.receive_timeout, "get option").await?;
        match response.content {
            Content::GetOptResponse(r) if r.option_value.option == option => Ok(r.option_value.value),
            Content::GetOptResponse(r) => Err(ProxyError::protocol(format!("requested option {:?}, response was for {:?}", option, r.option_value.option))),
            other => Err(ProxyError::protocol(format!("expected get option response, was {:?}", other.kind()))),
        }
    }

    /// Unlinks from the proxy and tears down the local stream concurrently. Closing succeeds if
    ///  either of them succeeds, and it returns the proxy's statistics if the unlink did.
    ///
    /// Closing a link that is closing or closed already is a no-op. Closing a link that is being
    ///  opened makes the open fail, and the link is closed once the open is done.
    #[instrument(level = "debug", skip_all, fields(proxy = %self.proxy.address, link = %self.remote_id))]
    pub async fn close(&self) -> ProxyResult<Option<CloseResponse>> {
        {
            let mut state = self.state.write().await;
            match *state {
                LinkState::Closing | LinkState::Closed => return Ok(None),
                LinkState::Opening => {
                    debug!("link {} is opening, closing it afterwards", self.remote_id);
                    self.close_requested.store(true, Ordering::Release);
                    return Ok(None);
                }
                _ => *state = LinkState::Closing,
            }
        }

        let (unlinked, torn_down) = tokio::join!(self.unlink(), self.teardown());
        *self.state.write().await = LinkState::Closed;

        match (unlinked, torn_down) {
            (Ok(stats), torn_down) => {
                if let Err(e) = torn_down {
                    info!("local teardown of link {} failed: {}", self.remote_id, e);
                }
                Ok(Some(stats))
            }
            (Err(e), Ok(())) => {
                info!("unlinking {} from proxy {} failed, local teardown succeeded: {}", self.remote_id, self.proxy.address, e);
                Ok(None)
            }
            (Err(unlink_error), Err(teardown_error)) => {
                warn!("closing link {} failed: {} / {}", self.remote_id, unlink_error, teardown_error);
                Err(ProxyError::Aggregate(vec![unlink_error, teardown_error]))
            }
        }
    }

    async fn unlink(&self) -> ProxyResult<CloseResponse> {
        let request = Message::new(self.socket_id, self.remote_id, Content::Close)
            .with_proxy(self.proxy.address);
        let response = Self::call(&self.provider, &self.proxy, request, self.provider.config.close_timeout, "close").await?;

        match response.content {
            Content::CloseResponse(stats) => {
                let local_time_open = self.opened_at.read().await
                    .map(|t| t.elapsed());
                info!("link {} closed: open for {} ms ({:?} locally), {} bytes sent, {} bytes received, error code {}",
                    self.remote_id, stats.time_open_ms, local_time_open, stats.bytes_sent, stats.bytes_received, stats.error_code);
                Ok(stats)
            }
            other => Err(ProxyError::protocol(format!("expected close response, was {:?}", other.kind()))),
        }
    }

    async fn teardown(&self) -> ProxyResult<()> {
        let close_timeout = self.provider.config.close_timeout;
        let stream_closed = match timeout(close_timeout, self.stream.close()).await {
            Ok(result) => result.map_err(ProxyError::Transport),
            Err(_) => Err(ProxyError::timeout("closing stream")),
        };

        let connection = self.connection.write().await.take();
        let connection_closed = match connection {
            Some(connection) => match timeout(close_timeout, connection.close()).await {
                Ok(result) => result.map_err(ProxyError::Transport),
                Err(_) => Err(ProxyError::timeout("closing connection")),
            },
            None => Ok(()),
        };

        match (stream_closed, connection_closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(ProxyError::Aggregate(vec![a, b])),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::error::SocketError;
    use crate::test_util::TestEnv;

    async fn linked(env: &TestEnv, index: usize) -> ProxyLink {
        ProxyLink::link(
            env.provider.clone(),
            Reference::new_random(),
            &SocketInfo::tcp(SocketAddress::proxy("target", 80)),
            env.proxy_record(index).await,
        ).await.unwrap()
    }

    #[tokio::test]
    async fn test_link_handshake() {
        let env = TestEnv::new(1);
        let socket_id = Reference::new_random();
        let link = ProxyLink::link(
            env.provider.clone(),
            socket_id,
            &SocketInfo::tcp(SocketAddress::proxy("target", 80)),
            env.proxy_record(0).await,
        ).await.unwrap();

        assert_eq!(link.state().await, LinkState::Linked);
        assert!(!link.remote_id().is_null());
        assert_ne!(link.stream_id(), link.remote_id());
        assert_ne!(link.stream_id(), socket_id);
        assert_eq!(link.peer_address(), &SocketAddress::proxy("target", 80));

        let requests = env.remoting.requests_of_kind(ContentKind::Link).await;
        assert_eq!(requests.len(), 1);
        let (proxy, request) = &requests[0];
        assert_eq!(*proxy, env.proxies[0]);
        assert_eq!(request.source, socket_id);
        assert_eq!(request.target, Reference::NULL);
        assert_eq!(request.proxy, env.proxies[0]);
    }

    #[rstest]
    #[case::refused(SocketError::Refused)]
    #[case::bad_version(SocketError::BadVersion)]
    #[tokio::test]
    async fn test_link_rejected(#[case] error: SocketError) {
        let env = TestEnv::new(1);
        env.remoting.reject_links_for(env.proxies[0], error).await;

        let result = ProxyLink::link(
            env.provider.clone(),
            Reference::new_random(),
            &SocketInfo::tcp(SocketAddress::Unspecified),
            env.proxy_record(0).await,
        ).await;
        assert!(matches!(result, Err(ProxyError::Remote(e)) if e == error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_timeout() {
        let env = TestEnv::new(1);
        env.remoting.hang_for(env.proxies[0], ContentKind::Link).await;

        let result = ProxyLink::link(
            env.provider.clone(),
            Reference::new_random(),
            &SocketInfo::tcp(SocketAddress::Unspecified),
            env.proxy_record(0).await,
        ).await;
        assert!(matches!(result, Err(ProxyError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_open_and_send() {
        let env = TestEnv::new(1);
        let link = linked(&env, 0).await;
        link.open().await.unwrap();
        assert_eq!(link.state().await, LinkState::Open);

        let open_requests = env.remoting.requests_of_kind(ContentKind::Open).await;
        assert_eq!(open_requests.len(), 1);
        let (_, open_request) = &open_requests[0];
        assert_eq!(open_request.target, link.remote_id());
        let Content::Open(open) = &open_request.content else { panic!() };
        assert_eq!(open.stream_id, link.stream_id());
        assert!(open.is_polled);

        let mut connection = env.stream_service.next_connection().await.unwrap();
        assert_eq!(connection.connection.connection_string(), open.connection_string);

        link.send(Data::new(Bytes::from_static(b"hello"))).await.unwrap();
        let sent = connection.peer.next_sent().await.unwrap();
        assert_eq!(sent.source, link.stream_id());
        assert_eq!(sent.target, link.remote_id());
        assert!(matches!(sent.content, Content::Data(d) if d.payload.as_ref() == b"hello"));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let env = TestEnv::new(1);
        let link = linked(&env, 0).await;
        assert!(matches!(link.send(Data::new(Bytes::new())).await, Err(ProxyError::NotLinked(_))));
    }

    #[tokio::test]
    async fn test_failed_open_closes_link() {
        let env = TestEnv::new(1);
        env.stream_service.fail_open_for(env.proxies[0]).await;
        let link = linked(&env, 0).await;

        assert!(link.open().await.is_err());
        assert_eq!(link.state().await, LinkState::Closed);
        assert_eq!(env.remoting.requests_of_kind(ContentKind::Close).await.len(), 1);

        let connection = env.stream_service.next_connection().await.unwrap();
        assert!(connection.connection.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_is_a_failure() {
        let env = TestEnv::new(1);
        env.remoting.hang_for(env.proxies[0], ContentKind::Open).await;
        let link = linked(&env, 0).await;

        assert!(matches!(link.open().await, Err(ProxyError::Timeout(_))));
        assert_eq!(link.state().await, LinkState::Closed);
    }

    #[rstest]
    #[case::both_succeed(false, false, true)]
    #[case::unlink_fails(true, false, true)]
    #[case::teardown_fails(false, true, true)]
    #[case::both_fail(true, true, false)]
    #[tokio::test]
    async fn test_close_is_best_effort(#[case] fail_unlink: bool, #[case] fail_teardown: bool, #[case] expect_success: bool) {
        let env = TestEnv::new(1);
        if fail_unlink {
            env.remoting.fail_for(env.proxies[0], ContentKind::Close).await;
        }
        if fail_teardown {
            env.stream_service.fail_close_for(env.proxies[0]).await;
        }

        let link = linked(&env, 0).await;
        link.open().await.unwrap();

        let result = link.close().await;
        assert_eq!(result.is_ok(), expect_success);
        if !fail_unlink {
            let stats = result.unwrap().unwrap();
            assert_eq!(stats.bytes_received, 20);
        }
        assert_eq!(link.state().await, LinkState::Closed);

        // closing again is a no-op
        assert!(matches!(link.close().await, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_opening_takes_effect_after_open() {
        let env = TestEnv::new(1);
        env.remoting.delay_for(env.proxies[0], ContentKind::Open, Duration::from_secs(1)).await;
        let link = Arc::new(linked(&env, 0).await);

        let opening = link.clone();
        let open = tokio::spawn(async move { opening.open().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(link.state().await, LinkState::Opening);

        assert!(matches!(link.close().await, Ok(None)));
        assert!(matches!(open.await.unwrap(), Err(ProxyError::Closed)));
        assert_eq!(link.state().await, LinkState::Closed);
        assert_eq!(env.remoting.requests_of_kind(ContentKind::Close).await.len(), 1);
        assert!(env.stream_service.next_connection().await.unwrap().connection.is_closed());
    }

    #[tokio::test]
    async fn test_options() {
        let env = TestEnv::new(1);
        let link = linked(&env, 0).await;

        link.set_option(SocketOptionValue::new(SocketOption::Ttl, 17)).await.unwrap();
        assert_eq!(link.get_option(SocketOption::Ttl).await.unwrap(), 17);
        assert!(matches!(link.get_option(SocketOption::Linger).await, Err(ProxyError::Remote(SocketError::Missing))));
    }
}
