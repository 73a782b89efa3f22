//! Framing and packet-kind dispatch.
//!
//! [`MessageManager`] implements the tokio-util [`Decoder`]/[`Encoder`]
//! pair for GOSOC packets. One manager is created per connection and
//! cloned onto the read and write halves; the negotiated
//! [`ProtocolCommon`] sits behind a shared lock so the Connect that the
//! reader decodes immediately governs how the writer frames payloads.

use std::{
    io,
    sync::{Arc, RwLock},
};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Connect,
    FixHeader,
    MessageType,
    Packet,
    ProtocolCommon,
    encoding::{self, MAX_REMAINING_LEN},
    error::ProtocolError,
};

/// Encodes and decodes packets while carrying the per-connection protocol
/// parameters.
///
/// Cloning is cheap and shares the underlying [`ProtocolCommon`]; that is
/// the point — the reader and writer halves of one connection must observe
/// the same negotiated state.
#[derive(Clone, Debug, Default)]
pub struct MessageManager {
    common: Arc<RwLock<ProtocolCommon>>,
}

impl MessageManager {
    /// Manager for a server-side connection: parameters are all zero until
    /// the first Connect decodes.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Manager seeded with explicit parameters, as a dialing client does.
    #[must_use]
    pub fn with_common(common: ProtocolCommon) -> Self {
        Self {
            common: Arc::new(RwLock::new(common)),
        }
    }

    /// Snapshot of the current protocol parameters.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned, which requires a panic
    /// while holding it; nothing in this module can panic there.
    #[must_use]
    pub fn common(&self) -> ProtocolCommon {
        self.common.read().expect("protocol state lock poisoned").clone()
    }

    /// Negotiated keep-alive interval; zero until the handshake completes.
    #[must_use]
    pub fn keep_alive_secs(&self) -> u16 { self.common().keep_alive_secs }

    fn adopt(&self, connect: &Connect) {
        let mut common = self.common.write().expect("protocol state lock poisoned");
        *common = ProtocolCommon {
            name: connect.protocol_name.clone(),
            version: connect.protocol_version,
            keep_alive_secs: connect.keep_alive_secs,
            enable_payload_gzip: connect.enable_payload_gzip,
        };
    }
}

impl Decoder for MessageManager {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, io::Error> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let msg_type = MessageType::from_nibble(first >> 4).map_err(io::Error::from)?;
        let flags = first & 0x0f;
        // Bit 0 is reserved and must be zero.
        if flags & 0x01 != 0 {
            return Err(ProtocolError::InvalidFlag { flags }.into());
        }
        let Some((remaining_len, len_len)) =
            encoding::peek_length(&src[1..]).map_err(io::Error::from)?
        else {
            return Ok(None);
        };
        let header_len = 1 + len_len;
        let total = header_len + remaining_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        let mut body = src.split_to(remaining_len as usize).freeze();

        let header = FixHeader {
            msg_type,
            flags,
            remaining_len,
        };
        // Connect decodes without negotiated state and then seeds it for
        // every later packet on this connection.
        let common = self.common();
        let packet = Packet::decode_body(header, &mut body, &common).map_err(io::Error::from)?;
        if !body.is_empty() {
            return Err(ProtocolError::MessageTooLong {
                len: body.len() as u64,
            }
            .into());
        }
        if let Packet::Connect(connect) = &packet {
            self.adopt(connect);
        }
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for MessageManager {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
        let common = self.common();
        // An outgoing Connect is stamped with the manager's parameters; the
        // caller only supplies the login payload.
        let item = match item {
            Packet::Connect(connect) => Packet::Connect(Connect {
                protocol_name: common.name.clone(),
                protocol_version: common.version,
                keep_alive_secs: common.keep_alive_secs,
                enable_payload_gzip: common.enable_payload_gzip,
                payload: connect.payload,
            }),
            other => other,
        };

        let mut body = BytesMut::new();
        item.encode_body(&common, &mut body).map_err(io::Error::from)?;
        if body.len() as u64 > u64::from(MAX_REMAINING_LEN) {
            return Err(ProtocolError::MessageTooLong {
                len: body.len() as u64,
            }
            .into());
        }
        dst.reserve(body.len() + 5);
        dst.extend_from_slice(&[((item.message_type() as u8) << 4) | (item.header_flags() & 0x0f)]);
        encoding::put_length(body.len() as u32, dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
