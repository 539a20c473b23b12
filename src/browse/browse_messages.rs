use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::address::SocketAddress;
use crate::reference::Reference;
use crate::util::buf::{put_bytes, try_get_bytes};

pub const BROWSE_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BrowseRequestType {
    Cancel = 0,
    Resolve = 1,
    Service = 2,
    Dirpath = 3,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct BrowseRequestFlags: u32 {
        /// answer from the proxy's cache without querying the network
        const CACHE_ONLY = 0x1;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct BrowseResponseFlags: u32 {
        /// end of stream, nothing more will follow for this handle
        const EOS = 0x1;
        const REMOVED = 0x2;
        /// everything that is currently known was sent, more may follow later
        const ALL_FOR_NOW = 0x4;
        const EMPTY = 0x8;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrowseRequest {
    pub version: u8,
    pub handle: Reference,
    pub item: SocketAddress,
    pub request_type: BrowseRequestType,
    pub flags: BrowseRequestFlags,
}

impl BrowseRequest {
    pub fn new(handle: Reference, item: SocketAddress, request_type: BrowseRequestType, flags: BrowseRequestFlags) -> BrowseRequest {
        BrowseRequest {
            version: BROWSE_VERSION,
            handle,
            item,
            request_type,
            flags,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        self.handle.ser(buf);
        self.item.ser(buf);
        buf.put_u8(self.request_type.into());
        buf.put_u32(self.flags.bits());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BrowseRequest> {
        let version = buf.try_get_u8()?;
        if version != BROWSE_VERSION {
            bail!("unsupported browse version {}", version);
        }
        let handle = Reference::deser(buf)?;
        let item = SocketAddress::deser(buf)?;
        let raw_type = buf.try_get_u8()?;
        let request_type = match BrowseRequestType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => bail!("invalid browse request type {}", raw_type),
        };
        let flags = BrowseRequestFlags::from_bits_retain(buf.try_get_u32()?);

        Ok(BrowseRequest {
            version,
            handle,
            item,
            request_type,
            flags,
        })
    }
}

/// A typed property of a browse result, e.g. a service's TXT record or a file's size
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrowseProperty {
    pub kind: u32,
    pub value: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrowseResponse {
    pub handle: Reference,
    pub flags: BrowseResponseFlags,
    pub error: i32,
    pub item: SocketAddress,
    pub properties: Vec<BrowseProperty>,
}

impl BrowseResponse {
    pub fn is_empty(&self) -> bool {
        self.flags.contains(BrowseResponseFlags::EMPTY)
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BrowseResponseFlags::EOS)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.handle.ser(buf);
        buf.put_u32(self.flags.bits());
        buf.put_i32(self.error);
        self.item.ser(buf);
        buf.put_usize_varint(self.properties.len());
        for property in &self.properties {
            buf.put_u32(property.kind);
            put_bytes(buf, &property.value);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BrowseResponse> {
        let handle = Reference::deser(buf)?;
        let flags = BrowseResponseFlags::from_bits_retain(buf.try_get_u32()?);
        let error = buf.try_get_i32()?;
        let item = SocketAddress::deser(buf)?;

        let num_properties = buf.try_get_usize_varint()?;
        let mut properties = Vec::new();
        for _ in 0..num_properties {
            properties.push(BrowseProperty {
                kind: buf.try_get_u32()?,
                value: try_get_bytes(buf)?,
            });
        }

        Ok(BrowseResponse {
            handle,
            flags,
            error,
            item,
            properties,
        })
    }
}
