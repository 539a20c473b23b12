use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHasher;
use tracing::debug;

use crate::reference::Reference;
use crate::util::buf::{put_string, try_get_array, try_get_string};

/// Address family tags. The numeric values are shared with the remote proxy implementation and
///  must not change.
///
/// NB: `Bound` and `Collection` are local tags only, they are never written to the wire
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum AddressFamily {
    Unspecified = 0,
    Unix = 1,
    InterNetwork = 2,
    InterNetworkV6 = 23,
    Proxy = 28165,
    Bound = 28166,
    Collection = 28167,
}

/// A socket address in one of the forms the proxy protocol knows about.
///
/// `Proxy` addresses are host names resolved on the proxy side. They are also used to carry
///  references and discovery queries as 'pseudo hosts'. Their `flags` and `interface_index` are
///  routing metadata and do not take part in equality.
///
/// A `Collection` stands for a socket that spans several proxy links. It can only be created
///  through [SocketAddress::collection], which flattens nested collections and removes
///  duplicates, so a collection never (visibly) nests and always has at least two members.
#[derive(Clone, Debug)]
pub enum SocketAddress {
    Unspecified,
    Unix {
        path: String,
    },
    Inet4 {
        addr: [u8; 4],
        port: u16,
    },
    Inet6 {
        addr: [u8; 16],
        port: u16,
        flow: u32,
        scope_id: u32,
    },
    Proxy {
        host: String,
        port: u16,
        flags: u16,
        interface_index: i32,
    },
    Bound {
        local: Box<SocketAddress>,
        remote: Box<SocketAddress>,
    },
    Collection(AddressCollection),
}

/// The flat, duplicate free member list of a [SocketAddress::Collection]
#[derive(Clone, Debug)]
pub struct AddressCollection(Vec<SocketAddress>);

impl AddressCollection {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddress> {
        self.0.iter()
    }
}

impl SocketAddress {
    pub fn proxy(host: impl Into<String>, port: u16) -> SocketAddress {
        SocketAddress::Proxy {
            host: host.into(),
            port,
            flags: 0,
            interface_index: -1,
        }
    }

    pub fn bound(local: SocketAddress, remote: SocketAddress) -> SocketAddress {
        SocketAddress::Bound {
            local: Box::new(local),
            remote: Box::new(remote),
        }
    }

    /// Builds an address from any number of addresses, flattening nested collections and
    ///  removing duplicates. No members yields `Unspecified`, a single distinct member yields
    ///  that member itself.
    pub fn collection(addresses: impl IntoIterator<Item = SocketAddress>) -> SocketAddress {
        let mut members: Vec<SocketAddress> = Vec::new();
        for addr in addresses {
            match addr {
                SocketAddress::Collection(nested) => {
                    for member in nested.0 {
                        if !members.contains(&member) {
                            members.push(member);
                        }
                    }
                }
                other => {
                    if !members.contains(&other) {
                        members.push(other);
                    }
                }
            }
        }

        match members.len() {
            0 => SocketAddress::Unspecified,
            1 => members.remove(0),
            _ => SocketAddress::Collection(AddressCollection(members)),
        }
    }

    /// Reinterprets a reference's 16 bytes as an IPv6 address. This is lossless, see
    ///  [SocketAddress::to_reference].
    pub fn from_reference(reference: Reference) -> SocketAddress {
        SocketAddress::Inet6 {
            addr: reference.to_bytes(),
            port: 0,
            flow: 0,
            scope_id: 0,
        }
    }

    /// Recovers the reference carried by this address, if any:
    /// * the 16 address bytes of an `Inet6` address
    /// * the host of a `Proxy` address if it is a reference in string form
    /// * the reference carried by the remote part of a `Bound` address
    pub fn to_reference(&self) -> Option<Reference> {
        match self {
            SocketAddress::Inet6 { addr, .. } => Some(Reference::from_bytes(*addr)),
            SocketAddress::Proxy { host, .. } => Reference::from_str(host).ok(),
            SocketAddress::Bound { remote, .. } => remote.to_reference(),
            _ => None,
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::Unspecified => AddressFamily::Unspecified,
            SocketAddress::Unix { .. } => AddressFamily::Unix,
            SocketAddress::Inet4 { .. } => AddressFamily::InterNetwork,
            SocketAddress::Inet6 { .. } => AddressFamily::InterNetworkV6,
            SocketAddress::Proxy { .. } => AddressFamily::Proxy,
            SocketAddress::Bound { .. } => AddressFamily::Bound,
            SocketAddress::Collection(_) => AddressFamily::Collection,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, SocketAddress::Unspecified)
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            SocketAddress::Inet4 { port, .. } |
            SocketAddress::Inet6 { port, .. } |
            SocketAddress::Proxy { port, .. } => Some(*port),
            SocketAddress::Bound { remote, .. } => remote.port(),
            _ => None,
        }
    }

    /// Iterates over all addresses this address stands for: the members of a collection, or
    ///  the address itself
    pub fn iter(&self) -> Box<dyn Iterator<Item = &SocketAddress> + Send + '_> {
        match self {
            SocketAddress::Collection(members) => Box::new(members.iter().flat_map(|m| m.iter())),
            other => Box::new(std::iter::once(other)),
        }
    }

    /// The form this address takes on the wire: `Bound` addresses are sent as their remote
    ///  peer, collections as their first member
    pub fn wire_form(&self) -> &SocketAddress {
        match self {
            SocketAddress::Bound { remote, .. } => remote.wire_form(),
            SocketAddress::Collection(members) => {
                debug!("serializing address collection of {} as its first member", members.len());
                members.0.first()
                    .map(|m| m.wire_form())
                    .unwrap_or(&SocketAddress::Unspecified)
            }
            other => other,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let wire = self.wire_form();
        buf.put_u16(wire.family().into());

        match wire {
            SocketAddress::Unspecified => {}
            SocketAddress::Unix { path } => {
                put_string(buf, path);
            }
            SocketAddress::Inet4 { addr, port } => {
                buf.put_slice(addr);
                buf.put_u16(*port);
            }
            SocketAddress::Inet6 { addr, port, flow, scope_id } => {
                buf.put_slice(addr);
                buf.put_u16(*port);
                buf.put_u32(*flow);
                buf.put_u32(*scope_id);
            }
            SocketAddress::Proxy { host, port, flags, interface_index } => {
                put_string(buf, host);
                buf.put_u16(*port);
                buf.put_u16(*flags);
                buf.put_i32(*interface_index);
            }
            SocketAddress::Bound { .. } | SocketAddress::Collection(_) => {
                unreachable!("wire_form() decomposes local-only address forms")
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketAddress> {
        let raw_family = buf.try_get_u16()?;
        let family = match AddressFamily::try_from(raw_family) {
            Ok(f) => f,
            Err(_) => bail!("invalid address family {}", raw_family),
        };

        let result = match family {
            AddressFamily::Unspecified => SocketAddress::Unspecified,
            AddressFamily::Unix => SocketAddress::Unix {
                path: try_get_string(buf)?,
            },
            AddressFamily::InterNetwork => SocketAddress::Inet4 {
                addr: try_get_array(buf)?,
                port: buf.try_get_u16()?,
            },
            AddressFamily::InterNetworkV6 => SocketAddress::Inet6 {
                addr: try_get_array(buf)?,
                port: buf.try_get_u16()?,
                flow: buf.try_get_u32()?,
                scope_id: buf.try_get_u32()?,
            },
            AddressFamily::Proxy => SocketAddress::Proxy {
                host: try_get_string(buf)?,
                port: buf.try_get_u16()?,
                flags: buf.try_get_u16()?,
                interface_index: buf.try_get_i32()?,
            },
            AddressFamily::Bound | AddressFamily::Collection => {
                bail!("address family {:?} is local only and must not be received", family)
            }
        };
        Ok(result)
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        use SocketAddress::*;

        match (self, other) {
            (Unspecified, Unspecified) => true,
            (Unix { path: a }, Unix { path: b }) => a == b,
            (Inet4 { addr: a, port: pa }, Inet4 { addr: b, port: pb }) => a == b && pa == pb,
            (Inet6 { addr: a, port: pa, flow: fa, scope_id: sa }, Inet6 { addr: b, port: pb, flow: fb, scope_id: sb }) => {
                a == b && pa == pb && fa == fb && sa == sb
            }
            // flags and interface index are deliberately not compared
            (Proxy { host: a, port: pa, .. }, Proxy { host: b, port: pb, .. }) => a == b && pa == pb,
            (Bound { local: la, remote: ra }, Bound { local: lb, remote: rb }) => la == lb && ra == rb,
            (Collection(a), Collection(b)) => {
                a.len() == b.len() && a.iter().all(|m| b.0.contains(m))
            }
            _ => false,
        }
    }
}
impl Eq for SocketAddress {}

impl Hash for SocketAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        u16::from(self.family()).hash(state);
        match self {
            SocketAddress::Unspecified => {}
            SocketAddress::Unix { path } => path.hash(state),
            SocketAddress::Inet4 { addr, port } => {
                addr.hash(state);
                port.hash(state);
            }
            SocketAddress::Inet6 { addr, port, flow, scope_id } => {
                addr.hash(state);
                port.hash(state);
                flow.hash(state);
                scope_id.hash(state);
            }
            SocketAddress::Proxy { host, port, .. } => {
                host.hash(state);
                port.hash(state);
            }
            SocketAddress::Bound { local, remote } => {
                local.hash(state);
                remote.hash(state);
            }
            SocketAddress::Collection(members) => {
                // order independent to be consistent with set equality
                let combined = members.iter()
                    .map(|m| {
                        let mut hasher = FxHasher::default();
                        m.hash(&mut hasher);
                        hasher.finish()
                    })
                    .fold(0u64, |acc, h| acc ^ h);
                members.len().hash(state);
                combined.hash(state);
            }
        }
    }
}

impl Display for SocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Unspecified => write!(f, "*"),
            SocketAddress::Unix { path } => write!(f, "unix:{}", path),
            SocketAddress::Inet4 { addr, port } => write!(f, "{}:{}", Ipv4Addr::from(*addr), port),
            SocketAddress::Inet6 { addr, port, .. } => write!(f, "[{}]:{}", Ipv6Addr::from(*addr), port),
            SocketAddress::Proxy { host, port, .. } => write!(f, "{}:{}", host, port),
            SocketAddress::Bound { local, remote } => write!(f, "{}->{}", local, remote),
            SocketAddress::Collection(members) => {
                write!(f, "{{")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(a) => SocketAddress::Inet4 {
                addr: a.ip().octets(),
                port: a.port(),
            },
            SocketAddr::V6(a) => SocketAddress::Inet6 {
                addr: a.ip().octets(),
                port: a.port(),
                flow: a.flowinfo(),
                scope_id: a.scope_id(),
            },
        }
    }
}

impl TryFrom<&SocketAddress> for SocketAddr {
    type Error = anyhow::Error;

    fn try_from(value: &SocketAddress) -> Result<Self, Self::Error> {
        match value {
            SocketAddress::Inet4 { addr, port } => Ok(SocketAddr::V4(SocketAddrV4::new((*addr).into(), *port))),
            SocketAddress::Inet6 { addr, port, flow, scope_id } => {
                Ok(SocketAddr::V6(SocketAddrV6::new((*addr).into(), *port, *flow, *scope_id)))
            }
            SocketAddress::Proxy { host, port, .. } => match IpAddr::from_str(host) {
                Ok(ip) => Ok(SocketAddr::new(ip, *port)),
                Err(_) => bail!("proxy host {} is not an IP address", host),
            },
            SocketAddress::Bound { remote, .. } => SocketAddr::try_from(remote.as_ref()),
            other => bail!("{} has no IP socket address representation", other),
        }
    }
}
