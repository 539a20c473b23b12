use bytes::{Buf, BufMut, BytesMut};

use crate::error::SocketError;
use crate::message::content::Content;
use crate::reference::Reference;
use crate::util::buf::{put_bool, try_get_bool};

/// The envelope exchanged with proxies, both on the control channel and on streams.
///
/// ```ascii
/// 0: version (u16)
/// 2: source (16 bytes)
/// 18: proxy (16 bytes)
/// 34: target (16 bytes)
/// 50: error code (i32)
/// 54: is response (u8, 0 or 1)
/// 55: type id (u32)
/// 59: body (depends on type id and polarity)
/// ```
///
/// Type id and polarity are not stored in the struct: they are derived from the content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub version: u16,
    pub source: Reference,
    pub proxy: Reference,
    pub target: Reference,
    pub error: i32,
    pub content: Content,
}

impl Message {
    pub const VERSION: u16 = 1;

    pub fn new(source: Reference, target: Reference, content: Content) -> Message {
        Message {
            version: Self::VERSION,
            source,
            proxy: Reference::NULL,
            target,
            error: SocketError::Success.code(),
            content,
        }
    }

    pub fn with_proxy(mut self, proxy: Reference) -> Message {
        self.proxy = proxy;
        self
    }

    pub fn with_error(mut self, error: SocketError) -> Message {
        self.error = error.code();
        self
    }

    /// A response travels back along the request's route
    pub fn response_to(request: &Message, content: Content) -> Message {
        Message {
            version: request.version,
            source: request.target,
            proxy: request.proxy,
            target: request.source,
            error: SocketError::Success.code(),
            content,
        }
    }

    pub fn type_id(&self) -> u32 {
        self.content.type_id()
    }

    pub fn is_response(&self) -> bool {
        self.content.is_response()
    }

    pub fn socket_error(&self) -> SocketError {
        SocketError::from(self.error)
    }

    pub fn is_success(&self) -> bool {
        self.socket_error().is_success()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version);
        self.source.ser(buf);
        self.proxy.ser(buf);
        self.target.ser(buf);
        buf.put_i32(self.error);
        put_bool(buf, self.is_response());
        buf.put_u32(self.type_id());
        self.content.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let version = buf.try_get_u16()?;
        let source = Reference::deser(buf)?;
        let proxy = Reference::deser(buf)?;
        let target = Reference::deser(buf)?;
        let error = buf.try_get_i32()?;
        let is_response = try_get_bool(buf)?;
        let type_id = buf.try_get_u32()?;
        let content = Content::deser(type_id, is_response, buf)?;

        Ok(Message {
            version,
            source,
            proxy,
            target,
            error,
            content,
        })
    }
}
