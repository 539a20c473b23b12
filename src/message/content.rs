use bytes::{Buf, BytesMut};

use crate::message::payloads::*;

pub const TYPE_ID_CUSTOM: u32 = 0;
pub const TYPE_ID_PING: u32 = 10;
/// Legacy type id of the older protocol generation. It is not part of the content table, so
///  messages with this id decode as [Content::Custom].
pub const TYPE_ID_RESOLVE: u32 = 11;
pub const TYPE_ID_LINK: u32 = 12;
pub const TYPE_ID_SET_OPT: u32 = 13;
pub const TYPE_ID_GET_OPT: u32 = 14;
pub const TYPE_ID_OPEN: u32 = 20;
pub const TYPE_ID_CLOSE: u32 = 21;
pub const TYPE_ID_DATA: u32 = 30;
pub const TYPE_ID_POLL: u32 = 31;

/// The payload of a [crate::message::Message]. Type id and polarity (request or response) are
///  a function of the variant, see [CONTENT_TYPES].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Content {
    Ping(Ping),
    PingResponse(PingResponse),
    Link(Link),
    LinkResponse(LinkResponse),
    SetOpt(SetOpt),
    SetOptResponse,
    GetOpt(GetOpt),
    GetOptResponse(GetOptResponse),
    Open(Open),
    OpenResponse,
    Close,
    CloseResponse(CloseResponse),
    Data(Data),
    Poll(Poll),
    Custom(Custom),
}

/// The discriminant of [Content], used as the index into [CONTENT_TYPES]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentKind {
    Ping = 0,
    PingResponse = 1,
    Link = 2,
    LinkResponse = 3,
    SetOpt = 4,
    SetOptResponse = 5,
    GetOpt = 6,
    GetOptResponse = 7,
    Open = 8,
    OpenResponse = 9,
    Close = 10,
    CloseResponse = 11,
    Data = 12,
    Poll = 13,
    Custom = 14,
}

pub struct ContentType {
    pub kind: ContentKind,
    pub type_id: u32,
    pub is_response: bool,
}

const fn ct(kind: ContentKind, type_id: u32, is_response: bool) -> ContentType {
    ContentType { kind, type_id, is_response }
}

/// Maps content variants to (type id, polarity) and back. Entry `i` describes the variant with
///  discriminant `i`.
pub static CONTENT_TYPES: [ContentType; 15] = [
    ct(ContentKind::Ping, TYPE_ID_PING, false),
    ct(ContentKind::PingResponse, TYPE_ID_PING, true),
    ct(ContentKind::Link, TYPE_ID_LINK, false),
    ct(ContentKind::LinkResponse, TYPE_ID_LINK, true),
    ct(ContentKind::SetOpt, TYPE_ID_SET_OPT, false),
    ct(ContentKind::SetOptResponse, TYPE_ID_SET_OPT, true),
    ct(ContentKind::GetOpt, TYPE_ID_GET_OPT, false),
    ct(ContentKind::GetOptResponse, TYPE_ID_GET_OPT, true),
    ct(ContentKind::Open, TYPE_ID_OPEN, false),
    ct(ContentKind::OpenResponse, TYPE_ID_OPEN, true),
    ct(ContentKind::Close, TYPE_ID_CLOSE, false),
    ct(ContentKind::CloseResponse, TYPE_ID_CLOSE, true),
    ct(ContentKind::Data, TYPE_ID_DATA, false),
    ct(ContentKind::Poll, TYPE_ID_POLL, false),
    ct(ContentKind::Custom, TYPE_ID_CUSTOM, false),
];

impl ContentKind {
    pub fn content_type(self) -> &'static ContentType {
        &CONTENT_TYPES[self as usize]
    }

    /// Finds the content variant for a type id and polarity. `Custom` is never returned, it is
    ///  the fallback for everything that is not in the table.
    pub fn lookup(type_id: u32, is_response: bool) -> Option<ContentKind> {
        CONTENT_TYPES.iter()
            .filter(|t| t.kind != ContentKind::Custom)
            .find(|t| t.type_id == type_id && t.is_response == is_response)
            .map(|t| t.kind)
    }
}

impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Ping(_) => ContentKind::Ping,
            Content::PingResponse(_) => ContentKind::PingResponse,
            Content::Link(_) => ContentKind::Link,
            Content::LinkResponse(_) => ContentKind::LinkResponse,
            Content::SetOpt(_) => ContentKind::SetOpt,
            Content::SetOptResponse => ContentKind::SetOptResponse,
            Content::GetOpt(_) => ContentKind::GetOpt,
            Content::GetOptResponse(_) => ContentKind::GetOptResponse,
            Content::Open(_) => ContentKind::Open,
            Content::OpenResponse => ContentKind::OpenResponse,
            Content::Close => ContentKind::Close,
            Content::CloseResponse(_) => ContentKind::CloseResponse,
            Content::Data(_) => ContentKind::Data,
            Content::Poll(_) => ContentKind::Poll,
            Content::Custom(_) => ContentKind::Custom,
        }
    }

    pub fn type_id(&self) -> u32 {
        match self {
            Content::Custom(c) => c.type_id,
            other => other.kind().content_type().type_id,
        }
    }

    pub fn is_response(&self) -> bool {
        match self {
            Content::Custom(c) => c.is_response,
            other => other.kind().content_type().is_response,
        }
    }

    /// Writes the body only, type id and polarity are part of the envelope
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Content::Ping(p) => p.ser(buf),
            Content::PingResponse(p) => p.ser(buf),
            Content::Link(p) => p.ser(buf),
            Content::LinkResponse(p) => p.ser(buf),
            Content::SetOpt(p) => p.ser(buf),
            Content::GetOpt(p) => p.ser(buf),
            Content::GetOptResponse(p) => p.ser(buf),
            Content::Open(p) => p.ser(buf),
            Content::CloseResponse(p) => p.ser(buf),
            Content::Data(p) => p.ser(buf),
            Content::Poll(p) => p.ser(buf),
            Content::Custom(p) => p.ser(buf),
            Content::SetOptResponse | Content::OpenResponse | Content::Close => {}
        }
    }

    /// Decodes a body based on the type id and polarity from the envelope. Unknown combinations
    ///  are preserved as [Content::Custom], while a malformed body of a known type is an error.
    pub fn deser(type_id: u32, is_response: bool, buf: &mut impl Buf) -> anyhow::Result<Content> {
        let kind = match ContentKind::lookup(type_id, is_response) {
            Some(kind) => kind,
            None => return Ok(Content::Custom(Custom::deser(type_id, is_response, buf))),
        };

        let content = match kind {
            ContentKind::Ping => Content::Ping(Ping::deser(buf)?),
            ContentKind::PingResponse => Content::PingResponse(PingResponse::deser(buf)?),
            ContentKind::Link => Content::Link(Link::deser(buf)?),
            ContentKind::LinkResponse => Content::LinkResponse(LinkResponse::deser(buf)?),
            ContentKind::SetOpt => Content::SetOpt(SetOpt::deser(buf)?),
            ContentKind::SetOptResponse => Content::SetOptResponse,
            ContentKind::GetOpt => Content::GetOpt(GetOpt::deser(buf)?),
            ContentKind::GetOptResponse => Content::GetOptResponse(GetOptResponse::deser(buf)?),
            ContentKind::Open => Content::Open(Open::deser(buf)?),
            ContentKind::OpenResponse => Content::OpenResponse,
            ContentKind::Close => Content::Close,
            ContentKind::CloseResponse => Content::CloseResponse(CloseResponse::deser(buf)?),
            ContentKind::Data => Content::Data(Data::deser(buf)?),
            ContentKind::Poll => Content::Poll(Poll::deser(buf)?),
            ContentKind::Custom => Content::Custom(Custom::deser(type_id, is_response, buf)),
        };
        Ok(content)
    }
}
