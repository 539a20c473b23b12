use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::address::{AddressFamily, SocketAddress};
use crate::util::safe_converter::{MillisCast, SafeCast};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SocketType {
    Stream = 1,
    Dgram = 2,
    Raw = 3,
    Rdm = 4,
    SeqPacket = 5,
    #[num_enum(default)]
    Unknown = -1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ProtocolType {
    Unspecified = 0,
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    IcmpV6 = 58,
    #[num_enum(default)]
    Unknown = -1,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct SocketFlags: u32 {
        /// The socket accepts rather than initiates, e.g. a listening TCP socket
        const PASSIVE = 0x1;
        /// Used by the library itself, e.g. for browse sockets
        const INTERNAL = 0x2;
    }
}

/// Socket options that can be applied to a proxied socket. They are forwarded to the proxy
///  as-is, either in a `SetOpt` request or as part of the [SocketInfo] sent while linking.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SocketOption {
    ReuseAddress = 1,
    KeepAlive = 2,
    NoDelay = 3,
    Broadcast = 4,
    ReceiveBuffer = 5,
    SendBuffer = 6,
    ReceiveTimeout = 7,
    SendTimeout = 8,
    Linger = 9,
    Ttl = 10,
    MulticastTtl = 11,
    MulticastLoopback = 12,
    IpV6Only = 13,
    ExclusiveAddressUse = 14,
}

impl SocketOption {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32((*self).into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketOption> {
        let raw = buf.try_get_u32()?;
        match SocketOption::try_from(raw) {
            Ok(option) => Ok(option),
            Err(_) => bail!("invalid socket option {}", raw),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SocketOptionValue {
    pub option: SocketOption,
    pub value: u64,
}

impl SocketOptionValue {
    pub fn new(option: SocketOption, value: u64) -> SocketOptionValue {
        SocketOptionValue { option, value }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.option.ser(buf);
        buf.put_u64(self.value);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketOptionValue> {
        Ok(SocketOptionValue {
            option: SocketOption::deser(buf)?,
            value: buf.try_get_u64()?,
        })
    }
}

/// Everything a proxy needs to know to create the real socket on its side of a link
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SocketInfo {
    pub family: AddressFamily,
    pub socket_type: SocketType,
    pub protocol: ProtocolType,
    pub flags: SocketFlags,
    pub timeout: Duration,
    pub address: SocketAddress,
    /// options set on the socket before it had any links
    pub options: Vec<SocketOptionValue>,
}

impl SocketInfo {
    pub fn new(socket_type: SocketType, protocol: ProtocolType, address: SocketAddress) -> SocketInfo {
        SocketInfo {
            family: address.wire_form().family(),
            socket_type,
            protocol,
            flags: SocketFlags::empty(),
            timeout: Duration::ZERO,
            address,
            options: Vec::new(),
        }
    }

    pub fn tcp(address: SocketAddress) -> SocketInfo {
        Self::new(SocketType::Stream, ProtocolType::Tcp, address)
    }

    pub fn udp(address: SocketAddress) -> SocketInfo {
        Self::new(SocketType::Dgram, ProtocolType::Udp, address)
    }

    pub fn is_passive(&self) -> bool {
        self.flags.contains(SocketFlags::PASSIVE)
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(SocketFlags::INTERNAL)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.family.into());
        buf.put_i32(self.socket_type.into());
        buf.put_i32(self.protocol.into());
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.timeout.as_millis_u32());
        self.address.ser(buf);
        buf.put_usize_varint(self.options.len());
        for option in &self.options {
            option.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketInfo> {
        let raw_family = buf.try_get_u16()?;
        let family = match AddressFamily::try_from(raw_family) {
            Ok(f) => f,
            Err(_) => bail!("invalid address family {}", raw_family),
        };
        let socket_type = SocketType::from(buf.try_get_i32()?);
        let protocol = ProtocolType::from(buf.try_get_i32()?);
        let flags = SocketFlags::from_bits_retain(buf.try_get_u32()?);
        let timeout = Duration::from_millis(buf.try_get_u32()?.safe_cast());
        let address = SocketAddress::deser(buf)?;

        let num_options = buf.try_get_usize_varint()?;
        let mut options = Vec::new();
        for _ in 0..num_options {
            options.push(SocketOptionValue::deser(buf)?);
        }

        Ok(SocketInfo {
            family,
            socket_type,
            protocol,
            flags,
            timeout,
            address,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::tcp_no_options(SocketInfo::tcp(SocketAddress::proxy("host", 80)))]
    #[case::udp_passive(SocketInfo {
        flags: SocketFlags::PASSIVE,
        timeout: Duration::from_millis(1500),
        ..SocketInfo::udp(SocketAddress::Inet4 { addr: [127,0,0,1], port: 53 })
    })]
    #[case::with_options(SocketInfo {
        options: vec![
            SocketOptionValue::new(SocketOption::NoDelay, 1),
            SocketOptionValue::new(SocketOption::ReceiveBuffer, 65536),
        ],
        ..SocketInfo::tcp(SocketAddress::Unspecified)
    })]
    #[case::internal(SocketInfo {
        flags: SocketFlags::INTERNAL | SocketFlags::PASSIVE,
        ..SocketInfo::new(SocketType::Dgram, ProtocolType::Unspecified, SocketAddress::Unix { path: "/b".to_string() })
    })]
    fn test_ser_deser(#[case] info: SocketInfo) {
        let mut buf = BytesMut::new();
        info.ser(&mut buf);

        let mut deser_buf: &[u8] = &buf;
        let deser = SocketInfo::deser(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(deser, info);
    }

    #[test]
    fn test_family_follows_wire_form() {
        let info = SocketInfo::tcp(SocketAddress::bound(
            SocketAddress::Unspecified,
            SocketAddress::Inet4 { addr: [1,1,1,1], port: 1 },
        ));
        assert_eq!(info.family, AddressFamily::InterNetwork);
    }

    #[rstest]
    #[case::valid(vec![0,0,0,3], Some(SocketOption::NoDelay))]
    #[case::zero(vec![0,0,0,0], None)]
    #[case::out_of_range(vec![0,0,0,99], None)]
    #[case::truncated(vec![0,0,3], None)]
    fn test_option_deser(#[case] raw: Vec<u8>, #[case] expected: Option<SocketOption>) {
        assert_eq!(SocketOption::deser(&mut raw.as_slice()).ok(), expected);
    }

    #[rstest]
    #[case::stream(1, SocketType::Stream)]
    #[case::dgram(2, SocketType::Dgram)]
    #[case::unknown(77, SocketType::Unknown)]
    fn test_socket_type_from_raw(#[case] raw: i32, #[case] expected: SocketType) {
        assert_eq!(SocketType::from(raw), expected);
    }
}
