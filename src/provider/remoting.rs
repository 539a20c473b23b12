use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::message::Message;
use crate::provider::name_service::NameRecord;

/// What a broadcast should do after a response was handled
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BroadcastControl {
    /// keep collecting responses
    Continue,
    /// send the broadcast again
    Retry,
    /// stop, no more responses are needed
    Done,
}

pub type BroadcastHandler = Box<dyn FnMut(Message) -> BroadcastControl + Send>;

/// The asynchronous store-and-forward control channel to the proxies. The concrete RPC
///  transport is not part of this library.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Remoting: Send + Sync + 'static {
    /// Sends a request to a single proxy and waits for its response
    async fn call(&self, proxy: &NameRecord, message: Message, timeout: Duration) -> anyhow::Result<Message>;

    /// Sends a message to all proxies, passing responses to `handler` until it returns `Done`
    ///  or the timeout expires
    async fn broadcast(&self, message: Message, handler: BroadcastHandler, timeout: Duration) -> anyhow::Result<()>;
}
