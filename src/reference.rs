use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::util::buf::try_get_array;

/// A [Reference] is the 128 bit identity of every entity in the protocol: sockets, links,
///  streams, proxies and name records. It is used for correlating requests and responses, and
///  it is routable: every reference can be carried as an IPv6 shaped socket address and
///  recovered byte for byte (see [crate::address::SocketAddress::from_reference]).
///
/// References are generated randomly, so there is no coordination between peers. There are two
///  well-known values:
/// * [Reference::NULL] (all zero) for 'no target', e.g. before a link exists
/// * [Reference::ALL] (all 0xFF) for 'broadcast to every proxy'
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Reference([u8; 16]);

impl Reference {
    pub const SERIALIZED_LEN: usize = 16;

    pub const NULL: Reference = Reference([0; 16]);
    pub const ALL: Reference = Reference([0xff; 16]);

    pub fn new_random() -> Reference {
        Reference(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Reference {
        Reference(bytes)
    }

    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::ALL
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Reference> {
        Ok(Reference(try_get_array(buf)?))
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl Debug for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NULL => write!(f, "Reference(NULL)"),
            Self::ALL => write!(f, "Reference(ALL)"),
            _ => write!(f, "Reference({})", self),
        }
    }
}

impl FromStr for Reference {
    type Err = anyhow::Error;

    /// Accepts the canonical (hyphenated) form as well as the 32 hex digit simple form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|e| anyhow!("not a valid reference: {:?} ({})", s, e))?;
        Ok(Reference(uuid.into_bytes()))
    }
}

impl From<[u8; 16]> for Reference {
    fn from(value: [u8; 16]) -> Self {
        Reference(value)
    }
}
