use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::address::SocketAddress;
use crate::error::SocketError;
use crate::message::content::ContentKind;
use crate::message::payloads::{CloseResponse, GetOptResponse, LinkResponse};
use crate::message::{Content, Message};
use crate::provider::name_service::NameRecord;
use crate::provider::remoting::{BroadcastControl, BroadcastHandler, Remoting};
use crate::reference::Reference;
use crate::socket_info::{SocketOption, SocketOptionValue};

/// A [Remoting] that plays the proxy side of the control channel in memory. Every proxy
///  accepts everything by default. Individual proxies can be scripted to reject links, and to
///  fail, delay or never answer requests of a given kind.
///
/// All requests are recorded for later inspection.
#[derive(Default)]
pub struct FakeRemoting {
    requests: RwLock<Vec<(Reference, Message)>>,
    link_rejections: RwLock<FxHashMap<Reference, SocketError>>,
    failures: RwLock<Vec<(Reference, ContentKind)>>,
    hangs: RwLock<Vec<(Reference, ContentKind)>>,
    delays: RwLock<FxHashMap<(Reference, ContentKind), Duration>>,
    options: RwLock<FxHashMap<(Reference, SocketOption), u64>>,
    broadcast_responses: RwLock<Vec<Message>>,
}

impl FakeRemoting {
    pub async fn reject_links_for(&self, proxy: Reference, error: SocketError) {
        self.link_rejections.write().await.insert(proxy, error);
    }

    pub async fn fail_for(&self, proxy: Reference, kind: ContentKind) {
        self.failures.write().await.push((proxy, kind));
    }

    pub async fn hang_for(&self, proxy: Reference, kind: ContentKind) {
        self.hangs.write().await.push((proxy, kind));
    }

    /// answers requests of the given kind only after a delay
    pub async fn delay_for(&self, proxy: Reference, kind: ContentKind, delay: Duration) {
        self.delays.write().await.insert((proxy, kind), delay);
    }

    pub async fn set_option_value(&self, proxy: Reference, option: SocketOption, value: u64) {
        self.options.write().await.insert((proxy, option), value);
    }

    pub async fn add_broadcast_response(&self, response: Message) {
        self.broadcast_responses.write().await.push(response);
    }

    pub async fn requests_of_kind(&self, kind: ContentKind) -> Vec<(Reference, Message)> {
        self.requests.read().await
            .iter()
            .filter(|(_, m)| m.content.kind() == kind)
            .cloned()
            .collect()
    }

    fn answer(&self, proxy: Reference, request: &Message, options: &mut FxHashMap<(Reference, SocketOption), u64>, link_rejection: Option<SocketError>) -> anyhow::Result<Message> {
        let content = match &request.content {
            Content::Link(link) => {
                if let Some(error) = link_rejection {
                    return Ok(Message::response_to(request, Content::LinkResponse(LinkResponse {
                        link_id: Reference::NULL,
                        local_address: SocketAddress::Unspecified,
                        peer_address: SocketAddress::Unspecified,
                    })).with_error(error));
                }
                Content::LinkResponse(LinkResponse {
                    link_id: Reference::new_random(),
                    local_address: SocketAddress::from_reference(proxy),
                    peer_address: link.socket_info.address.wire_form().clone(),
                })
            }
            Content::SetOpt(set_opt) => {
                options.insert((proxy, set_opt.option_value.option), set_opt.option_value.value);
                Content::SetOptResponse
            }
            Content::GetOpt(get_opt) => match options.get(&(proxy, get_opt.option)) {
                Some(value) => Content::GetOptResponse(GetOptResponse {
                    option_value: SocketOptionValue::new(get_opt.option, *value),
                }),
                None => return Ok(Message::response_to(request, Content::GetOptResponse(GetOptResponse {
                    option_value: SocketOptionValue::new(get_opt.option, 0),
                })).with_error(SocketError::Missing)),
            },
            Content::Open(_) => Content::OpenResponse,
            Content::Close => Content::CloseResponse(CloseResponse {
                time_open_ms: 1000,
                bytes_sent: 10,
                bytes_received: 20,
                error_code: 0,
            }),
            other => bail!("fake proxy does not handle {:?}", other.kind()),
        };
        Ok(Message::response_to(request, content))
    }
}

#[async_trait]
impl Remoting for FakeRemoting {
    async fn call(&self, proxy: &NameRecord, message: Message, _timeout: Duration) -> anyhow::Result<Message> {
        let kind = message.content.kind();
        self.requests.write().await.push((proxy.address, message.clone()));

        if self.hangs.read().await.contains(&(proxy.address, kind)) {
            std::future::pending::<()>().await;
        }
        let delay = self.delays.read().await.get(&(proxy.address, kind)).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.read().await.contains(&(proxy.address, kind)) {
            bail!("simulated failure of {:?} for proxy {}", kind, proxy.address);
        }

        let link_rejection = self.link_rejections.read().await.get(&proxy.address).cloned();
        let mut options = self.options.write().await;
        self.answer(proxy.address, &message, &mut options, link_rejection)
    }

    async fn broadcast(&self, message: Message, mut handler: BroadcastHandler, _timeout: Duration) -> anyhow::Result<()> {
        self.requests.write().await.push((Reference::ALL, message));
        for response in self.broadcast_responses.read().await.iter() {
            if handler(response.clone()) == BroadcastControl::Done {
                break;
            }
        }
        Ok(())
    }
}
