use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, select_all, select_ok};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use crate::address::SocketAddress;
use crate::error::{ProxyError, ProxyResult};
use crate::link::proxy_link::ProxyLink;
use crate::message::payloads::Data;
use crate::message::{Content, Message};
use crate::provider::name_service::NameRecord;
use crate::provider::provider::Provider;
use crate::reference::Reference;
use crate::socket_info::{SocketInfo, SocketOption, SocketOptionValue};

/// A virtual socket spread over any number of proxy links.
///
/// Sends go to all links, receives merge all links' streams. Options are sent to all links, and
///  options set while there are no links yet are cached and passed to proxies as part of the
///  [SocketInfo] when linking.
pub struct ProxySocket {
    provider: Arc<Provider>,
    id: Reference,
    info: RwLock<SocketInfo>,
    links: RwLock<Vec<Arc<ProxyLink>>>,
    option_cache: Mutex<FxHashMap<SocketOption, u64>>,
    next_receive: AtomicUsize,
    is_closed: AtomicBool,
}

impl ProxySocket {
    pub fn new(provider: Arc<Provider>, info: SocketInfo) -> ProxySocket {
        ProxySocket {
            provider,
            id: Reference::new_random(),
            info: RwLock::new(info),
            links: Default::default(),
            option_cache: Default::default(),
            next_receive: AtomicUsize::new(0),
            is_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Reference {
        self.id
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub async fn info(&self) -> SocketInfo {
        self.info.read().await.clone()
    }

    pub async fn update_info(&self, f: impl FnOnce(&mut SocketInfo)) {
        let mut info = self.info.write().await;
        f(&mut info);
        info.family = info.address.wire_form().family();
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// The proxy-assigned ids of the socket's current links
    pub async fn link_ids(&self) -> Vec<Reference> {
        self.links.read().await.iter().map(|l| l.remote_id()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// The local addresses of all links, as a collection if there are several
    pub async fn local_address(&self) -> SocketAddress {
        SocketAddress::collection(self.links.read().await
            .iter()
            .map(|l| l.local_address().clone()))
    }

    pub async fn peer_address(&self) -> SocketAddress {
        SocketAddress::collection(self.links.read().await
            .iter()
            .map(|l| l.peer_address().clone()))
    }

    /// the socket info to send with `Link` requests, including all cached options
    async fn link_info(&self) -> SocketInfo {
        let mut info = self.info().await;
        let cache = self.option_cache.lock().await;
        info.options = cache.iter()
            .map(|(option, value)| SocketOptionValue::new(*option, *value))
            .collect();
        info.options.sort_by_key(|o| o.option);
        info
    }

    async fn candidates(&self) -> ProxyResult<Vec<NameRecord>> {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        let address = self.info.read().await.address.clone();
        let candidates = self.provider.resolve_proxies(&address).await?;
        if candidates.is_empty() {
            return Err(ProxyError::NotLinked(format!("no proxy available for {}", address)));
        }
        Ok(candidates)
    }

    async fn establish(&self, info: &SocketInfo, proxy: NameRecord) -> ProxyResult<Arc<ProxyLink>> {
        let link = ProxyLink::link(self.provider.clone(), self.id, info, proxy).await?;
        link.open().await?;
        Ok(Arc::new(link))
    }

    /// Links through all candidate proxies concurrently. Returns `true` iff at least one link
    ///  was established. Failing candidates are logged and otherwise ignored.
    #[instrument(level = "debug", skip_all, fields(socket = %self.id))]
    pub async fn link_all(&self) -> ProxyResult<bool> {
        let candidates = self.candidates().await?;
        let info = self.link_info().await;
        debug!("linking through {} proxies", candidates.len());

        let results = join_all(candidates.into_iter()
            .map(|proxy| {
                let proxy_address = proxy.address;
                self.establish(&info, proxy).map(move |r| (proxy_address, r))
            })
        ).await;

        let mut new_links = Vec::new();
        for (proxy, result) in results {
            match result {
                Ok(link) => new_links.push(link),
                Err(e) => info!("linking through proxy {} failed: {}", proxy, e),
            }
        }

        let num_linked = new_links.len();
        self.adopt(new_links).await?;
        debug!("{} new links", num_linked);
        Ok(num_linked > 0)
    }

    /// Tries candidate proxies one at a time, stopping at the first one that links
    #[instrument(level = "debug", skip_all, fields(socket = %self.id))]
    pub async fn link_one(&self) -> ProxyResult<bool> {
        let candidates = self.candidates().await?;
        let info = self.link_info().await;

        for proxy in candidates {
            let proxy_address = proxy.address;
            match self.establish(&info, proxy).await {
                Ok(link) => {
                    self.adopt(vec![link]).await?;
                    return Ok(true);
                }
                Err(e) => info!("linking through proxy {} failed, trying next candidate: {}", proxy_address, e),
            }
        }
        Ok(false)
    }

    /// Adds freshly established links. If the socket was closed while they were linking, they
    ///  are closed instead.
    async fn adopt(&self, new_links: Vec<Arc<ProxyLink>>) -> ProxyResult<()> {
        {
            let mut links = self.links.write().await;
            if !self.is_closed() {
                links.extend(new_links);
                return Ok(());
            }
        }

        if !new_links.is_empty() {
            info!("socket {} was closed while linking, closing {} new links", self.id, new_links.len());
            for result in join_all(new_links.iter().map(|l| l.close())).await {
                if let Err(e) = result {
                    debug!("closing link of closed socket failed: {}", e);
                }
            }
        }
        Err(ProxyError::Closed)
    }

    async fn links_snapshot(&self) -> Vec<Arc<ProxyLink>> {
        self.links.read().await.clone()
    }

    /// Sets an option on all links. Without links, the option is only cached for linking.
    pub async fn set_option(&self, option: SocketOption, value: u64) -> ProxyResult<()> {
        self.option_cache.lock().await
            .insert(option, value);

        let links = self.links_snapshot().await;
        if links.is_empty() {
            trace!("no links, caching option {:?}", option);
            return Ok(());
        }

        let option_value = SocketOptionValue::new(option, value);
        let results = join_all(links.iter()
            .map(|l| l.set_option(option_value))
        ).await;
        Self::any_success(results, "set option")
    }

    /// Reads an option from the first link that answers. Without links, the cached value is
    ///  returned.
    pub async fn get_option(&self, option: SocketOption) -> ProxyResult<u64> {
        let links = self.links_snapshot().await;
        if links.is_empty() {
            return match self.option_cache.lock().await.get(&option) {
                Some(value) => Ok(*value),
                None => Err(ProxyError::NotLinked(format!("option {:?} was not set", option))),
            };
        }

        let (value, _) = select_ok(links.iter()
            .map(|l| l.get_option(option).boxed())
        ).await?;
        Ok(value)
    }

    /// Sends data through all links. All links are tried, and if it fails for any of them, the
    ///  failures are reported together.
    pub async fn send(&self, data: Data) -> ProxyResult<()> {
        let links = self.links_snapshot().await;
        if links.is_empty() {
            return Err(if self.is_closed() { ProxyError::Closed } else { ProxyError::NotLinked("socket has no links".to_string()) });
        }

        let results = join_all(links.iter()
            .map(|l| l.send(data.clone()))
        ).await;

        let num_results = results.len();
        let errors = results.into_iter()
            .filter_map(|r| r.err())
            .collect::<Vec<_>>();
        if errors.is_empty() {
            return Ok(());
        }
        info!("send failed for {} of {} links", errors.len(), num_results);
        Err(ProxyError::aggregate(errors))
    }

    fn any_success(results: Vec<ProxyResult<()>>, what: &str) -> ProxyResult<()> {
        let num_results = results.len();
        let errors = results.into_iter()
            .filter_map(|r| r.err())
            .collect::<Vec<_>>();

        if errors.is_empty() {
            return Ok(());
        }
        if errors.len() < num_results {
            info!("{} failed for {} of {} links: {}", what, errors.len(), num_results, errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", "));
            return Ok(());
        }
        Err(ProxyError::aggregate(errors))
    }

    /// Receives the next data message from any link.
    ///
    /// Links are checked round robin for messages that are already there, and if there are
    ///  none, this waits for whichever link receives something first. A link closed by its proxy
    ///  is removed from the socket, and the socket is closed for reading when the last link is
    ///  gone.
    pub async fn receive(&self) -> ProxyResult<Message> {
        let (_, message) = self.receive_with_link().await?;
        Ok(message)
    }

    /// Same as [ProxySocket::receive], also returning the id of the link the message came through
    pub async fn receive_with_link(&self) -> ProxyResult<(Reference, Message)> {
        loop {
            let links = self.links_snapshot().await;
            if links.is_empty() {
                return Err(if self.is_closed() { ProxyError::Closed } else { ProxyError::NotLinked("socket has no links".to_string()) });
            }

            let start = self.next_receive.fetch_add(1, Ordering::Relaxed);
            let ready = (0..links.len())
                .map(|i| &links[(start + i) % links.len()])
                .find_map(|l| l.try_receive().map(|m| (l.clone(), Some(m))));

            let (link, received) = match ready {
                Some(r) => r,
                None => {
                    let ((link, received), _, _) = select_all(links.iter()
                        .map(|l| {
                            let l = l.clone();
                            async move {
                                let received = l.receive().await;
                                (l, received)
                            }.boxed()
                        })
                    ).await;
                    (link, received)
                }
            };

            match received {
                Some(message) if matches!(message.content, Content::Data(_)) => return Ok((link.remote_id(), message)),
                Some(message) if matches!(message.content, Content::Close) => {
                    info!("link {} was closed by proxy {} ({:?})", link.remote_id(), link.proxy().address, message.socket_error());
                    self.remove_link(&link).await;
                }
                None => {
                    info!("stream of link {} ended", link.remote_id());
                    self.remove_link(&link).await;
                }
                Some(message) => debug!("ignoring {:?} received through link {}", message.content.kind(), link.remote_id()),
            }
        }
    }

    async fn remove_link(&self, link: &Arc<ProxyLink>) {
        {
            let mut links = self.links.write().await;
            links.retain(|l| !Arc::ptr_eq(l, link));
            if links.is_empty() {
                info!("last link of socket {} is gone, closing the socket", self.id);
                self.is_closed.store(true, Ordering::Release);
            }
        }

        if let Err(e) = link.close().await {
            debug!("closing link {} after remote close failed: {}", link.remote_id(), e);
        }
    }

    /// Closes all links. This is idempotent, and it fails only if closing failed for every link.
    #[instrument(level = "debug", skip_all, fields(socket = %self.id))]
    pub async fn close(&self) -> ProxyResult<()> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let links = std::mem::take(&mut *self.links.write().await);
        if links.is_empty() {
            return Ok(());
        }

        let results = join_all(links.iter()
            .map(|l| l.close())
        ).await;

        let results = results.into_iter()
            .map(|r| r.map(|_| ()))
            .collect::<Vec<_>>();
        let result = Self::any_success(results, "close");
        match &result {
            Ok(()) => info!("socket {} closed", self.id),
            Err(e) => warn!("closing socket {} failed: {}", self.id, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::error::SocketError;
    use crate::message::content::ContentKind;
    use crate::test_util::TestEnv;

    fn data(seq: u64, payload: &'static [u8]) -> Message {
        Message::new(Reference::NULL, Reference::NULL, Content::Data(Data {
            sequence_number: seq,
            ..Data::new(Bytes::from_static(payload))
        }))
    }

    fn socket(env: &TestEnv) -> ProxySocket {
        ProxySocket::new(env.provider.clone(), SocketInfo::udp(SocketAddress::proxy("target", 53)))
    }

    #[tokio::test]
    async fn test_link_all_survives_rejecting_candidate() {
        let env = TestEnv::new(3);
        env.remoting.reject_links_for(env.proxies[1], SocketError::Refused).await;

        let socket = socket(&env);
        assert!(socket.link_all().await.unwrap());
        assert_eq!(socket.link_count().await, 2);

        let linked_proxies = socket.links_snapshot().await
            .iter()
            .map(|l| l.proxy().address)
            .collect::<Vec<_>>();
        assert_eq!(linked_proxies, vec![env.proxies[0], env.proxies[2]]);
    }

    #[tokio::test]
    async fn test_link_all_without_success() {
        let env = TestEnv::new(2);
        env.remoting.reject_links_for(env.proxies[0], SocketError::Refused).await;
        env.remoting.fail_for(env.proxies[1], ContentKind::Link).await;

        let socket = socket(&env);
        assert!(!socket.link_all().await.unwrap());
        assert_eq!(socket.link_count().await, 0);
    }

    #[tokio::test]
    async fn test_link_without_candidates() {
        let env = TestEnv::new(0);
        assert!(matches!(socket(&env).link_all().await, Err(ProxyError::NotLinked(_))));
    }

    #[tokio::test]
    async fn test_link_one_stops_at_first_success() {
        let env = TestEnv::new(3);
        env.remoting.reject_links_for(env.proxies[0], SocketError::Refused).await;

        let socket = socket(&env);
        assert!(socket.link_one().await.unwrap());
        assert_eq!(socket.link_count().await, 1);

        let link_requests = env.remoting.requests_of_kind(ContentKind::Link).await
            .into_iter()
            .map(|(p, _)| p)
            .collect::<Vec<_>>();
        assert_eq!(link_requests, vec![env.proxies[0], env.proxies[1]]);
    }

    #[tokio::test]
    async fn test_cached_options_are_sent_with_link() {
        let env = TestEnv::new(1);
        let socket = socket(&env);
        socket.set_option(SocketOption::ReceiveBuffer, 4096).await.unwrap();
        socket.set_option(SocketOption::Broadcast, 1).await.unwrap();
        assert!(env.remoting.requests_of_kind(ContentKind::SetOpt).await.is_empty());
        assert_eq!(socket.get_option(SocketOption::Broadcast).await.unwrap(), 1);

        assert!(socket.link_all().await.unwrap());

        let link_requests = env.remoting.requests_of_kind(ContentKind::Link).await;
        let Content::Link(link) = &link_requests[0].1.content else { panic!() };
        assert_eq!(link.socket_info.options, vec![
            SocketOptionValue::new(SocketOption::Broadcast, 1),
            SocketOptionValue::new(SocketOption::ReceiveBuffer, 4096),
        ]);
    }

    #[tokio::test]
    async fn test_set_option_fans_out() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        env.remoting.fail_for(env.proxies[0], ContentKind::SetOpt).await;
        socket.set_option(SocketOption::Ttl, 3).await.unwrap();
        assert_eq!(env.remoting.requests_of_kind(ContentKind::SetOpt).await.len(), 2);

        env.remoting.fail_for(env.proxies[1], ContentKind::SetOpt).await;
        assert!(matches!(socket.set_option(SocketOption::Ttl, 4).await, Err(ProxyError::Aggregate(e)) if e.len() == 2));
    }

    #[tokio::test]
    async fn test_get_option_first_reply_wins() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        env.remoting.hang_for(env.proxies[0], ContentKind::GetOpt).await;
        env.remoting.set_option_value(env.proxies[1], SocketOption::NoDelay, 1).await;
        assert_eq!(socket.get_option(SocketOption::NoDelay).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_option_all_fail() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        assert!(matches!(socket.get_option(SocketOption::Linger).await, Err(ProxyError::Remote(SocketError::Missing))));
    }

    #[tokio::test]
    async fn test_send_fans_out() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        let mut first = env.stream_service.next_connection().await.unwrap();
        let mut second = env.stream_service.next_connection().await.unwrap();

        socket.send(Data::new(Bytes::from_static(b"x"))).await.unwrap();
        assert!(matches!(first.peer.next_sent().await.unwrap().content, Content::Data(_)));
        assert!(matches!(second.peer.next_sent().await.unwrap().content, Content::Data(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reports_failure_of_any_link() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        let mut first = env.stream_service.next_connection().await.unwrap();
        let second = env.stream_service.next_connection().await.unwrap();
        second.peer.fail_sends();
        // the idle poll runs into the failing transport
        tokio::time::sleep(env.provider.config.poll_interval * 2).await;

        assert!(matches!(socket.send(Data::new(Bytes::from_static(b"x"))).await, Err(ProxyError::Transport(_))));
        assert!(matches!(first.peer.next_sent().await.unwrap().content, Content::Data(d) if d.payload.as_ref() == b"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_linking_all_closes_new_links() {
        let env = TestEnv::new(2);
        env.remoting.hang_for(env.proxies[1], ContentKind::Link).await;
        let socket = socket(&env);

        let (linked, closed) = tokio::join!(socket.link_all(), socket.close());
        assert!(matches!(linked, Err(ProxyError::Closed)));
        closed.unwrap();
        assert_eq!(socket.link_count().await, 0);

        let unlinked = env.remoting.requests_of_kind(ContentKind::Close).await
            .into_iter()
            .map(|(p, _)| p)
            .collect::<Vec<_>>();
        assert_eq!(unlinked, vec![env.proxies[0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_linking_one_closes_new_link() {
        let env = TestEnv::new(1);
        env.remoting.delay_for(env.proxies[0], ContentKind::Link, Duration::from_secs(1)).await;
        let socket = socket(&env);

        let (linked, closed) = tokio::join!(socket.link_one(), socket.close());
        assert!(matches!(linked, Err(ProxyError::Closed)));
        closed.unwrap();
        assert_eq!(socket.link_count().await, 0);
        assert_eq!(env.remoting.requests_of_kind(ContentKind::Close).await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_merges_links_and_detects_close() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        let first = env.stream_service.next_connection().await.unwrap();
        let second = env.stream_service.next_connection().await.unwrap();

        first.peer.deliver(data(0, b"a"));
        second.peer.deliver(data(0, b"b"));

        let mut payloads = Vec::new();
        for _ in 0..2 {
            let Content::Data(d) = socket.receive().await.unwrap().content else { panic!() };
            payloads.push(d.payload);
        }
        payloads.sort();
        assert_eq!(payloads, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        first.peer.deliver(Message::new(Reference::NULL, Reference::NULL, Content::Close));
        second.peer.deliver(data(1, b"c"));
        let Content::Data(d) = socket.receive().await.unwrap().content else { panic!() };
        assert_eq!(d.payload.as_ref(), b"c");

        second.peer.end();
        assert!(matches!(socket.receive().await, Err(ProxyError::Closed)));
        assert_eq!(socket.link_count().await, 0);
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn test_receive_waits_for_any_link() {
        let env = TestEnv::new(2);
        let socket = Arc::new(socket(&env));
        socket.link_all().await.unwrap();

        let _first = env.stream_service.next_connection().await.unwrap();
        let second = env.stream_service.next_connection().await.unwrap();

        let socket2 = socket.clone();
        let receiver = tokio::spawn(async move { socket2.receive().await });
        tokio::task::yield_now().await;

        second.peer.deliver(data(0, b"late"));
        let received = receiver.await.unwrap().unwrap();
        assert!(matches!(received.content, Content::Data(d) if d.payload.as_ref() == b"late"));
    }

    #[tokio::test]
    async fn test_local_and_peer_address_are_collections() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        assert_eq!(socket.local_address().await, SocketAddress::Unspecified);

        socket.link_all().await.unwrap();
        assert_eq!(socket.local_address().await.iter().count(), 2);
        // both proxies report the same peer, which collapses
        assert_eq!(socket.peer_address().await, SocketAddress::proxy("target", 53));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let env = TestEnv::new(2);
        let socket = socket(&env);
        socket.link_all().await.unwrap();

        socket.close().await.unwrap();
        socket.close().await.unwrap();
        assert_eq!(env.remoting.requests_of_kind(ContentKind::Close).await.len(), 2);
        assert!(matches!(socket.receive().await, Err(ProxyError::Closed)));
        assert!(matches!(socket.link_all().await, Err(ProxyError::Closed)));
    }
}
