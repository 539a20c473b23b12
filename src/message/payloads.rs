use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::SocketAddress;
use crate::reference::Reference;
use crate::socket_info::{SocketInfo, SocketOption, SocketOptionValue};
use crate::util::buf::{put_bool, put_bytes, put_string, try_get_bool, try_get_bytes, try_get_string};

/// Version of the link protocol. A proxy rejects links with a different version, and so do we
///  when decoding.
pub const LINK_VERSION: u32 = 7;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ping {
    pub address: SocketAddress,
}
impl Ping {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.address.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Ping> {
        Ok(Ping {
            address: SocketAddress::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PingResponse {
    pub address: SocketAddress,
    pub physical_address: SocketAddress,
    pub time_ms: u64,
}
impl PingResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.address.ser(buf);
        self.physical_address.ser(buf);
        buf.put_u64(self.time_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PingResponse> {
        Ok(PingResponse {
            address: SocketAddress::deser(buf)?,
            physical_address: SocketAddress::deser(buf)?,
            time_ms: buf.try_get_u64()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub version: u32,
    pub socket_info: SocketInfo,
}
impl Link {
    pub fn new(socket_info: SocketInfo) -> Link {
        Link {
            version: LINK_VERSION,
            socket_info,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        self.socket_info.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Link> {
        let version = buf.try_get_u32()?;
        if version != LINK_VERSION {
            bail!("unsupported link protocol version {}, expected {}", version, LINK_VERSION);
        }
        Ok(Link {
            version,
            socket_info: SocketInfo::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkResponse {
    /// the id the proxy assigned to the link, i.e. the link's `remote_id`
    pub link_id: Reference,
    pub local_address: SocketAddress,
    pub peer_address: SocketAddress,
}
impl LinkResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.link_id.ser(buf);
        self.local_address.ser(buf);
        self.peer_address.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LinkResponse> {
        Ok(LinkResponse {
            link_id: Reference::deser(buf)?,
            local_address: SocketAddress::deser(buf)?,
            peer_address: SocketAddress::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetOpt {
    pub option_value: SocketOptionValue,
}
impl SetOpt {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.option_value.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SetOpt> {
        Ok(SetOpt {
            option_value: SocketOptionValue::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetOpt {
    pub option: SocketOption,
}
impl GetOpt {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.option.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<GetOpt> {
        Ok(GetOpt {
            option: SocketOption::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetOptResponse {
    pub option_value: SocketOptionValue,
}
impl GetOptResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.option_value.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<GetOptResponse> {
        Ok(GetOptResponse {
            option_value: SocketOptionValue::deser(buf)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Open {
    pub stream_id: Reference,
    pub stream_type: String,
    pub connection_string: String,
    pub is_polled: bool,
    pub max_receive_buffer: u32,
}
impl Open {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.stream_id.ser(buf);
        put_string(buf, &self.stream_type);
        put_string(buf, &self.connection_string);
        put_bool(buf, self.is_polled);
        buf.put_u32(self.max_receive_buffer);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Open> {
        Ok(Open {
            stream_id: Reference::deser(buf)?,
            stream_type: try_get_string(buf)?,
            connection_string: try_get_string(buf)?,
            is_polled: try_get_bool(buf)?,
            max_receive_buffer: buf.try_get_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CloseResponse {
    pub time_open_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_code: i32,
}
impl CloseResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.time_open_ms);
        buf.put_u64(self.bytes_sent);
        buf.put_u64(self.bytes_received);
        buf.put_i32(self.error_code);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CloseResponse> {
        Ok(CloseResponse {
            time_open_ms: buf.try_get_u64()?,
            bytes_sent: buf.try_get_u64()?,
            bytes_received: buf.try_get_u64()?,
            error_code: buf.try_get_i32()?,
        })
    }
}

/// A unit of data on a stream. On the way out, `source_address` is the destination (for
///  datagram sockets sending to specific peers), on the way in it is the peer the data came from.
///
/// `sequence_number` is assigned by the stream's send pump, starting at 0 per stream and
///  direction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Data {
    pub source_address: SocketAddress,
    pub payload: Bytes,
    pub control: Bytes,
    pub sequence_number: u64,
}
impl Data {
    pub fn new(payload: Bytes) -> Data {
        Data {
            source_address: SocketAddress::Unspecified,
            payload,
            control: Bytes::new(),
            sequence_number: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.source_address.ser(buf);
        put_bytes(buf, &self.payload);
        put_bytes(buf, &self.control);
        buf.put_u64(self.sequence_number);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Data> {
        Ok(Data {
            source_address: SocketAddress::deser(buf)?,
            payload: try_get_bytes(buf)?,
            control: try_get_bytes(buf)?,
            sequence_number: buf.try_get_u64()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Poll {
    pub timeout_ms: u64,
}
impl Poll {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.timeout_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Poll> {
        Ok(Poll {
            timeout_ms: buf.try_get_u64()?,
        })
    }
}

/// Content with a type id this library does not know. The body is kept as-is so that the
///  message can be forwarded or re-encoded without loss.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Custom {
    pub type_id: u32,
    pub is_response: bool,
    pub body: Bytes,
}
impl Custom {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.body);
    }

    pub fn deser(type_id: u32, is_response: bool, buf: &mut impl Buf) -> Custom {
        Custom {
            type_id,
            is_response,
            body: buf.copy_to_bytes(buf.remaining()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_link_version_mismatch() {
        let mut buf = BytesMut::new();
        Link {
            version: LINK_VERSION + 1,
            socket_info: SocketInfo::tcp(SocketAddress::Unspecified),
        }.ser(&mut buf);

        let err = Link::deser(&mut buf.as_ref()).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[rstest]
    #[case::empty(Data::new(Bytes::new()), vec![0,0, 0, 0, 0,0,0,0,0,0,0,0])]
    #[case::payload_and_seq(Data { sequence_number: 258, ..Data::new(Bytes::from_static(b"hi")) }, vec![0,0, 2,104,105, 0, 0,0,0,0,0,0,1,2])]
    #[case::control(Data { control: Bytes::from_static(&[9]), ..Data::new(Bytes::new()) }, vec![0,0, 0, 1,9, 0,0,0,0,0,0,0,0])]
    fn test_data_wire_format(#[case] data: Data, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        data.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut deser_buf: &[u8] = &buf;
        assert_eq!(Data::deser(&mut deser_buf).unwrap(), data);
        assert!(deser_buf.is_empty());
    }

    #[rstest]
    #[case::missing_seq(vec![0,0, 0, 0, 0,0,0])]
    #[case::payload_overflow(vec![0,0, 5,1,2])]
    fn test_data_malformed(#[case] raw: Vec<u8>) {
        assert!(Data::deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_open_invalid_polled_flag() {
        let mut buf = BytesMut::new();
        Reference::new_random().ser(&mut buf);
        put_string(&mut buf, "t");
        put_string(&mut buf, "c");
        buf.put_u8(7);
        buf.put_u32(1);
        assert!(Open::deser(&mut buf.as_ref()).is_err());
    }

    #[test]
    fn test_custom_takes_remaining_body() {
        let mut buf: &[u8] = &[1, 2, 3];
        let custom = Custom::deser(99, true, &mut buf);
        assert_eq!(custom.body.as_ref(), &[1, 2, 3]);
        assert!(buf.is_empty());
    }
}
