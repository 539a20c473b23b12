use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::address::SocketAddress;
use crate::error::SocketError;
use crate::message::payloads::{Ping, PingResponse};
use crate::message::{Content, Message};
use crate::provider::name_service::NameQuery;
use crate::provider::provider::Provider;
use crate::provider::remoting::BroadcastControl;
use crate::reference::Reference;

/// Broadcasts a `Ping` for the given address to all proxies and collects the answers. Every
///  proxy that answers gets its name record's `last_activity` refreshed.
pub async fn ping(provider: &Provider, address: &SocketAddress) -> anyhow::Result<Vec<PingResponse>> {
    let request = Message::new(
        Reference::new_random(),
        Reference::ALL,
        Content::Ping(Ping { address: address.clone() }),
    );

    let (send, mut recv) = mpsc::unbounded_channel();
    let handler = Box::new(move |response: Message| {
        if response.socket_error() == SocketError::Retry {
            return BroadcastControl::Retry;
        }
        match response.content {
            Content::PingResponse(ping_response) => {
                if send.send((response.source, ping_response)).is_err() {
                    return BroadcastControl::Done;
                }
            }
            other => debug!("ignoring unexpected ping response content {:?}", other.kind()),
        }
        BroadcastControl::Continue
    });

    provider.remoting.broadcast(request, handler, provider.config.connect_timeout).await?;

    let mut result = Vec::new();
    while let Ok((proxy, ping_response)) = recv.try_recv() {
        touch_proxy(provider, proxy).await;
        result.push(ping_response);
    }

    info!("ping for {} was answered by {} proxies", address, result.len());
    Ok(result)
}

async fn touch_proxy(provider: &Provider, proxy: Reference) {
    let records = match provider.name_service.lookup(&NameQuery::ByAddress(proxy)).await {
        Ok(records) => records,
        Err(e) => {
            warn!("failed to look up proxy {}: {}", proxy, e);
            return;
        }
    };

    for mut record in records {
        record.last_activity = SystemTime::now();
        if let Err(e) = provider.name_service.update(record, false).await {
            warn!("failed to refresh name record of proxy {}: {}", proxy, e);
        }
    }
}
