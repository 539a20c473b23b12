use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid boolean value {}", n),
    }
}

/// Reads a fixed number of raw bytes, e.g. for 16 byte references
pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("buffer underflow: expected {} bytes, {} remaining", N, buf.remaining());
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}
