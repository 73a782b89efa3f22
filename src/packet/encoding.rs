//! Byte-level primitives shared by every packet body.
//!
//! The GOSOC body grammar is built from four field shapes: fixed-width
//! big-endian integers, var-int remaining lengths (seven value bits per
//! byte, high bit continues, at most four bytes), length-prefixed UTF-8
//! strings, and length-prefixed gzip streams. Binary data fields are
//! length-prefixed raw bytes whose decoder sniffs the gzip magic and
//! inflates transparently; the encoder writes caller bytes verbatim.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use super::error::ProtocolError;

/// Largest value representable by a four-byte var-int remaining length.
pub const MAX_REMAINING_LEN: u32 = (1 << 28) - 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode a var-int length from the front of `buf` without consuming it.
///
/// Returns `Ok(None)` when the buffer ends before the var-int does, so the
/// framed decoder can wait for more bytes. Fails with
/// [`ProtocolError::BadLengthEncoding`] once four bytes have been read with
/// the continuation bit still set.
pub(crate) fn peek_length(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for i in 0..4 {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    Err(ProtocolError::BadLengthEncoding)
}

/// Decode a var-int length from a fully buffered body.
///
/// Truncation here means the field claimed bytes the remaining length does
/// not cover, which is [`ProtocolError::DataExceedsPacket`].
fn take_length(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for _ in 0..4 {
        if buf.remaining() < 1 {
            return Err(ProtocolError::DataExceedsPacket);
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(ProtocolError::BadLengthEncoding)
}

/// Encode `len` as a var-int. Zero is a single `0x00` byte.
pub(crate) fn put_length(mut len: u32, dst: &mut BytesMut) {
    if len == 0 {
        dst.put_u8(0);
        return;
    }
    while len > 0 {
        let mut digit = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            digit |= 0x80;
        }
        dst.put_u8(digit);
    }
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::DataExceedsPacket);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::DataExceedsPacket);
    }
    Ok(buf.get_u16())
}

fn take_field(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = take_length(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::DataExceedsPacket);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = take_field(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read a length-prefixed gzip stream and inflate it to a string.
///
/// A zero-length field decodes to the empty string without opening a gzip
/// reader; an empty buffer is not a valid gzip stream.
pub(crate) fn get_gzip_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = take_field(buf)?;
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let mut inflated = Vec::new();
    GzDecoder::new(bytes.as_ref())
        .read_to_end(&mut inflated)
        .map_err(|e| ProtocolError::Gzip(e.to_string()))?;
    String::from_utf8(inflated).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read a length-prefixed binary field, inflating it when the first two
/// bytes carry the gzip magic.
pub(crate) fn get_data(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let bytes = take_field(buf)?;
    if bytes.len() > 1 && bytes[..2] == GZIP_MAGIC {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes.as_ref())
            .read_to_end(&mut inflated)
            .map_err(|e| ProtocolError::Gzip(e.to_string()))?;
        return Ok(Bytes::from(inflated));
    }
    Ok(bytes)
}

pub(crate) fn put_string(val: &str, dst: &mut BytesMut) {
    put_length(val.len() as u32, dst);
    dst.put_slice(val.as_bytes());
}

/// Write a string as a length-prefixed gzip stream.
///
/// The empty string still produces a complete (if pointless) gzip stream,
/// matching what peers emit.
pub(crate) fn put_gzip_string(val: &str, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(val.as_bytes())
        .and_then(|()| encoder.finish())
        .map_err(|e| ProtocolError::Gzip(e.to_string()))
        .map(|deflated| {
            put_length(deflated.len() as u32, dst);
            dst.put_slice(&deflated);
        })
}

/// Write a binary field verbatim. Compressing the bytes first is the
/// caller's choice; the decoder sniffs the gzip magic either way.
pub(crate) fn put_data(val: &[u8], dst: &mut BytesMut) {
    put_length(val.len() as u32, dst);
    dst.put_slice(val);
}
