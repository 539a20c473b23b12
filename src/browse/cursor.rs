use std::sync::Arc;

use rustc_hash::FxHashSet;

use bytes::BytesMut;
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

use crate::address::SocketAddress;
use crate::browse::browse_messages::{BrowseRequest, BrowseRequestFlags, BrowseRequestType, BrowseResponse, BrowseResponseFlags};
use crate::error::{ProxyError, ProxyResult, SocketError};
use crate::message::payloads::Data;
use crate::message::Content;
use crate::provider::provider::Provider;
use crate::reference::Reference;
use crate::socket::proxy_socket::ProxySocket;
use crate::socket_info::{ProtocolType, SocketFlags, SocketInfo, SocketType};

/// What a cursor does with a single browse response
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseAction {
    Yield,
    /// yield the response, and the proxy that sent it is done
    YieldAndFinish,
    Skip,
    Finish,
    Fail,
}

pub fn classify(response: &BrowseResponse, cache_only: bool) -> ResponseAction {
    let is_terminal = response.is_eos()
        || (cache_only && response.flags.contains(BrowseResponseFlags::ALL_FOR_NOW));

    match (response.is_empty(), is_terminal) {
        (true, _) if response.error != 0 && response.is_eos() => ResponseAction::Fail,
        (true, true) => ResponseAction::Finish,
        (true, false) => ResponseAction::Skip,
        (false, true) => ResponseAction::YieldAndFinish,
        (false, false) => ResponseAction::Yield,
    }
}

/// A forward-only enumeration of browse results.
///
/// Every cursor has its own internal datagram socket linked to all proxies that are
///  responsible for the browsed item. The request goes out once when the cursor is opened, and
///  [BrowseCursor::next] then returns the proxies' responses until each proxy signalled the end
///  of its results.
///
/// Closing the cursor cancels the request and closes the socket. A cursor that is dropped
///  without being closed is closed in the background.
pub struct BrowseCursor {
    socket: Arc<ProxySocket>,
    handle: Reference,
    item: SocketAddress,
    cache_only: bool,
    /// links that sent their terminal response
    finished_links: FxHashSet<Reference>,
    is_done: bool,
    is_closed: bool,
}

impl BrowseCursor {
    #[instrument(level = "debug", skip(provider))]
    pub async fn open(provider: Arc<Provider>, request_type: BrowseRequestType, item: SocketAddress, cache_only: bool) -> ProxyResult<BrowseCursor> {
        let info = SocketInfo {
            flags: SocketFlags::INTERNAL,
            ..SocketInfo::new(SocketType::Dgram, ProtocolType::Unspecified, item.clone())
        };
        let socket = Arc::new(ProxySocket::new(provider.clone(), info));

        let linked = match timeout(provider.config.link_timeout, socket.link_all()).await {
            Ok(Ok(linked)) => linked,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                Self::close_quietly(&socket).await;
                return Err(ProxyError::timeout(format!("linking browse socket for {}", item)));
            }
        };
        if !linked {
            return Err(ProxyError::NotLinked(format!("no proxy can browse {}", item)));
        }

        let mut cursor = BrowseCursor {
            socket,
            handle: Reference::new_random(),
            item,
            cache_only,
            finished_links: Default::default(),
            is_done: false,
            is_closed: false,
        };

        let flags = if cache_only { BrowseRequestFlags::CACHE_ONLY } else { BrowseRequestFlags::empty() };
        if let Err(e) = cursor.send_request(request_type, flags).await {
            warn!("sending browse request for {} failed: {}", cursor.item, e);
            let _ = cursor.close().await;
            return Err(e);
        }
        debug!("browsing {} with handle {}", cursor.item, cursor.handle);
        Ok(cursor)
    }

    /// Resolves a host or service name to its addresses
    pub async fn resolve(provider: Arc<Provider>, item: SocketAddress, cache_only: bool) -> ProxyResult<BrowseCursor> {
        Self::open(provider, BrowseRequestType::Resolve, item, cache_only).await
    }

    pub async fn services(provider: Arc<Provider>, item: SocketAddress, cache_only: bool) -> ProxyResult<BrowseCursor> {
        Self::open(provider, BrowseRequestType::Service, item, cache_only).await
    }

    pub async fn directory(provider: Arc<Provider>, item: SocketAddress, cache_only: bool) -> ProxyResult<BrowseCursor> {
        Self::open(provider, BrowseRequestType::Dirpath, item, cache_only).await
    }

    pub fn handle(&self) -> Reference {
        self.handle
    }

    async fn send_request(&self, request_type: BrowseRequestType, flags: BrowseRequestFlags) -> ProxyResult<()> {
        let request = BrowseRequest::new(self.handle, self.item.clone(), request_type, flags);
        let mut buf = BytesMut::new();
        request.ser(&mut buf);

        let send_timeout = self.socket.provider().config.send_timeout;
        timeout(send_timeout, self.socket.send(Data::new(buf.freeze()))).await?
    }

    /// Returns the next result, or `None` when all proxies are done or the cursor was closed.
    ///
    /// A timeout is reported as an error but does not end the enumeration.
    pub async fn next(&mut self) -> Option<ProxyResult<BrowseResponse>> {
        if self.is_done {
            return None;
        }

        let receive_timeout = self.socket.provider().config.receive_timeout;
        loop {
            let (link_id, message) = match timeout(receive_timeout, self.socket.receive_with_link()).await {
                Ok(Ok(received)) => received,
                Ok(Err(ProxyError::Closed)) => {
                    self.is_done = true;
                    return None;
                }
                Ok(Err(e)) => {
                    self.is_done = true;
                    return Some(Err(e));
                }
                Err(_) => return Some(Err(ProxyError::timeout(format!("browsing {}", self.item)))),
            };

            if !message.is_success() {
                return Some(Err(ProxyError::Remote(message.socket_error())));
            }
            let Content::Data(data) = message.content else {
                continue;
            };

            let response = match BrowseResponse::deser(&mut data.payload.clone()) {
                Ok(response) => response,
                Err(e) => {
                    self.is_done = true;
                    return Some(Err(ProxyError::protocol(format!("invalid browse response: {}", e))));
                }
            };
            if response.handle != self.handle {
                trace!("skipping response for handle {}", response.handle);
                continue;
            }

            match classify(&response, self.cache_only) {
                ResponseAction::Yield => return Some(Ok(response)),
                ResponseAction::YieldAndFinish => {
                    self.link_finished(link_id).await;
                    return Some(Ok(response));
                }
                ResponseAction::Skip => {}
                ResponseAction::Finish => {
                    if self.link_finished(link_id).await {
                        return None;
                    }
                }
                ResponseAction::Fail => {
                    self.is_done = true;
                    return Some(Err(ProxyError::Remote(SocketError::from(response.error))));
                }
            }
        }
    }

    /// Returns `true` if no link is still sending results. Repeated terminal responses from the
    ///  same link count once.
    async fn link_finished(&mut self, link_id: Reference) -> bool {
        if !self.finished_links.insert(link_id) {
            trace!("link {} finished before", link_id);
        }
        let link_ids = self.socket.link_ids().await;
        if link_ids.iter().all(|id| self.finished_links.contains(id)) {
            debug!("browsing {} is complete", self.item);
            self.is_done = true;
        }
        self.is_done
    }

    /// Cancels the request if it is still running and closes the browse socket
    pub async fn close(&mut self) -> ProxyResult<()> {
        if self.is_closed {
            return Ok(());
        }
        self.is_closed = true;

        if !self.is_done {
            self.is_done = true;
            if let Err(e) = self.send_request(BrowseRequestType::Cancel, BrowseRequestFlags::empty()).await {
                debug!("cancelling browse request {} failed: {}", self.handle, e);
            }
        }

        let close_timeout = self.socket.provider().config.close_timeout;
        timeout(close_timeout, self.socket.close()).await?
    }

    async fn close_quietly(socket: &ProxySocket) {
        if let Err(e) = socket.close().await {
            debug!("closing browse socket failed: {}", e);
        }
    }
}

impl Drop for BrowseCursor {
    fn drop(&mut self) {
        if self.is_closed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let socket = self.socket.clone();
                runtime.spawn(async move {
                    Self::close_quietly(&socket).await;
                });
            }
            Err(_) => warn!("browse cursor {} dropped outside of a runtime, links stay open until the proxies time out", self.handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::message::content::ContentKind;
    use crate::message::Message;
    use crate::test_util::stream::FakeConnectionHandle;
    use crate::test_util::TestEnv;

    fn response(handle: Reference, flags: BrowseResponseFlags, error: i32, host: &str) -> BrowseResponse {
        BrowseResponse {
            handle,
            flags,
            error,
            item: SocketAddress::proxy(host, 0),
            properties: vec![],
        }
    }

    fn deliver(connection: &FakeConnectionHandle, seq: u64, response: &BrowseResponse) {
        let mut buf = BytesMut::new();
        response.ser(&mut buf);
        connection.peer.deliver(Message::new(Reference::NULL, Reference::NULL, Content::Data(Data {
            sequence_number: seq,
            ..Data::new(buf.freeze())
        })));
    }

    async fn sent_request(connection: &mut FakeConnectionHandle) -> BrowseRequest {
        let Content::Data(data) = connection.peer.next_sent().await.unwrap().content else { panic!() };
        BrowseRequest::deser(&mut data.payload.clone()).unwrap()
    }

    #[rstest]
    #[case::plain(BrowseResponseFlags::empty(), 0, false, ResponseAction::Yield)]
    #[case::removed(BrowseResponseFlags::REMOVED, 0, false, ResponseAction::Yield)]
    #[case::last(BrowseResponseFlags::EOS, 0, false, ResponseAction::YieldAndFinish)]
    #[case::all_for_now(BrowseResponseFlags::ALL_FOR_NOW, 0, false, ResponseAction::Yield)]
    #[case::all_for_now_cached(BrowseResponseFlags::ALL_FOR_NOW, 0, true, ResponseAction::YieldAndFinish)]
    #[case::empty(BrowseResponseFlags::EMPTY, 0, false, ResponseAction::Skip)]
    #[case::empty_with_error(BrowseResponseFlags::EMPTY, 6, false, ResponseAction::Skip)]
    #[case::empty_eos(BrowseResponseFlags::EMPTY | BrowseResponseFlags::EOS, 0, false, ResponseAction::Finish)]
    #[case::empty_all_for_now_cached(BrowseResponseFlags::EMPTY | BrowseResponseFlags::ALL_FOR_NOW, 0, true, ResponseAction::Finish)]
    #[case::empty_eos_error(BrowseResponseFlags::EMPTY | BrowseResponseFlags::EOS, 10, false, ResponseAction::Fail)]
    fn test_classify(#[case] flags: BrowseResponseFlags, #[case] error: i32, #[case] cache_only: bool, #[case] expected: ResponseAction) {
        assert_eq!(classify(&response(Reference::NULL, flags, error, "x"), cache_only), expected);
    }

    #[tokio::test]
    async fn test_enumerate_single_proxy() {
        let env = TestEnv::new(1);
        let mut cursor = BrowseCursor::services(env.provider.clone(), SocketAddress::proxy("_http._tcp", 0), false).await.unwrap();

        let mut connection = env.stream_service.next_connection().await.unwrap();
        let request = sent_request(&mut connection).await;
        assert_eq!(request.handle, cursor.handle());
        assert_eq!(request.request_type, BrowseRequestType::Service);
        assert_eq!(request.flags, BrowseRequestFlags::empty());

        let link_requests = env.remoting.requests_of_kind(ContentKind::Link).await;
        let Content::Link(link) = &link_requests[0].1.content else { panic!() };
        assert!(link.socket_info.is_internal());

        let handle = cursor.handle();
        deliver(&connection, 0, &response(handle, BrowseResponseFlags::empty(), 0, "a"));
        deliver(&connection, 1, &response(Reference::new_random(), BrowseResponseFlags::empty(), 0, "other"));
        deliver(&connection, 2, &response(handle, BrowseResponseFlags::EMPTY, 0, ""));
        deliver(&connection, 3, &response(handle, BrowseResponseFlags::EOS, 0, "b"));

        assert_eq!(cursor.next().await.unwrap().unwrap().item, SocketAddress::proxy("a", 0));
        assert_eq!(cursor.next().await.unwrap().unwrap().item, SocketAddress::proxy("b", 0));
        assert!(cursor.next().await.is_none());
        assert!(cursor.next().await.is_none());

        cursor.close().await.unwrap();
        assert!(connection.connection.is_closed());
    }

    #[tokio::test]
    async fn test_ends_when_all_proxies_are_done() {
        let env = TestEnv::new(2);
        let mut cursor = BrowseCursor::resolve(env.provider.clone(), SocketAddress::proxy("printer", 0), true).await.unwrap();
        let handle = cursor.handle();

        let mut first = env.stream_service.next_connection().await.unwrap();
        let mut second = env.stream_service.next_connection().await.unwrap();
        assert_eq!(sent_request(&mut first).await.flags, BrowseRequestFlags::CACHE_ONLY);
        sent_request(&mut second).await;

        deliver(&first, 0, &response(handle, BrowseResponseFlags::ALL_FOR_NOW, 0, "a"));
        assert_eq!(cursor.next().await.unwrap().unwrap().item, SocketAddress::proxy("a", 0));

        deliver(&second, 0, &response(handle, BrowseResponseFlags::empty(), 0, "b"));
        assert_eq!(cursor.next().await.unwrap().unwrap().item, SocketAddress::proxy("b", 0));

        deliver(&second, 1, &response(handle, BrowseResponseFlags::EMPTY | BrowseResponseFlags::EOS, 0, ""));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_end_of_stream_counts_once() {
        let env = TestEnv::new(2);
        let mut cursor = BrowseCursor::services(env.provider.clone(), SocketAddress::proxy("_ipp._tcp", 0), false).await.unwrap();
        let handle = cursor.handle();

        let first = env.stream_service.next_connection().await.unwrap();
        let second = env.stream_service.next_connection().await.unwrap();

        deliver(&first, 0, &response(handle, BrowseResponseFlags::EOS, 0, "a"));
        assert_eq!(cursor.next().await.unwrap().unwrap().item, SocketAddress::proxy("a", 0));

        deliver(&first, 1, &response(handle, BrowseResponseFlags::EMPTY | BrowseResponseFlags::EOS, 0, ""));
        let (next, _) = tokio::join!(cursor.next(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            deliver(&second, 0, &response(handle, BrowseResponseFlags::EOS, 0, "b"));
        });
        assert_eq!(next.unwrap().unwrap().item, SocketAddress::proxy("b", 0));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_error() {
        let env = TestEnv::new(1);
        let mut cursor = BrowseCursor::directory(env.provider.clone(), SocketAddress::proxy("/tmp", 0), false).await.unwrap();
        let connection = env.stream_service.next_connection().await.unwrap();

        deliver(&connection, 0, &response(cursor.handle(), BrowseResponseFlags::EMPTY | BrowseResponseFlags::EOS, SocketError::NoHost.code(), ""));
        assert!(matches!(cursor.next().await, Some(Err(ProxyError::Remote(SocketError::NoHost)))));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let env = TestEnv::new(1);
        let mut cursor = BrowseCursor::services(env.provider.clone(), SocketAddress::Unspecified, false).await.unwrap();
        let connection = env.stream_service.next_connection().await.unwrap();

        connection.peer.deliver(Message::new(Reference::NULL, Reference::NULL, Content::Data(Data::new(Bytes::from_static(b"\x01\x02")))));
        assert!(matches!(cursor.next().await, Some(Err(ProxyError::Protocol(_)))));
    }

    #[tokio::test]
    async fn test_close_cancels_running_request() {
        let env = TestEnv::new(1);
        let mut cursor = BrowseCursor::services(env.provider.clone(), SocketAddress::Unspecified, false).await.unwrap();
        let mut connection = env.stream_service.next_connection().await.unwrap();
        sent_request(&mut connection).await;

        cursor.close().await.unwrap();
        let cancel = sent_request(&mut connection).await;
        assert_eq!(cancel.request_type, BrowseRequestType::Cancel);
        assert_eq!(cancel.handle, cursor.handle());
        assert!(cursor.next().await.is_none());
        assert!(connection.connection.is_closed());
    }

    #[tokio::test]
    async fn test_no_proxies() {
        let env = TestEnv::new(0);
        assert!(matches!(
            BrowseCursor::services(env.provider.clone(), SocketAddress::Unspecified, false).await,
            Err(ProxyError::NotLinked(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_closes_in_background() {
        let env = TestEnv::new(1);
        let cursor = BrowseCursor::services(env.provider.clone(), SocketAddress::Unspecified, false).await.unwrap();
        let connection = env.stream_service.next_connection().await.unwrap();
        drop(cursor);

        for _ in 0..100 {
            if connection.connection.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connection.connection.is_closed());
        assert_eq!(env.remoting.requests_of_kind(ContentKind::Close).await.len(), 1);
    }
}
