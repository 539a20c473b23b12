use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::message::Message;
use crate::provider::name_service::NameRecord;
use crate::reference::Reference;

/// An open, unordered, at-least-once message transport between this library and one proxy.
///  Ordering is restored (or rather: checked) by [crate::stream::multiplexer::LinkStream].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageStream: Send + Sync + 'static {
    async fn send(&self, message: Message) -> anyhow::Result<()>;

    /// `None` signals that the transport was closed
    async fn receive(&self) -> anyhow::Result<Option<Message>>;
}

/// A stream connection to a proxy, created by the [StreamService]. The proxy learns about it
///  through the `connection_string` sent in an `Open` request.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn connection_string(&self) -> String;

    /// Polled connections only deliver inbound messages in response to outbound traffic
    fn is_polled(&self) -> bool;

    async fn open(&self) -> anyhow::Result<Arc<dyn MessageStream>>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamService: Send + Sync + 'static {
    async fn create_connection(&self, stream_id: Reference, remote_id: Reference, proxy: &NameRecord) -> anyhow::Result<Arc<dyn Connection>>;
}
