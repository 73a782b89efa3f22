//! GOSOC packet model.
//!
//! A connection carries seven packet kinds over a fixed header of one type
//! byte and a var-int remaining length. [`Packet`] is the tagged union the
//! rest of the crate passes around; the per-kind structs own the body
//! fields. Encoding and decoding are driven by [`MessageManager`], which
//! also carries the per-connection [`ProtocolCommon`] parameters agreed at
//! Connect time.

mod encoding;
pub mod error;
mod manager;

use bytes::{Bytes, BytesMut};
pub use encoding::MAX_REMAINING_LEN;
pub use error::ProtocolError;
pub use manager::MessageManager;

use self::encoding::{
    get_data,
    get_gzip_string,
    get_string,
    get_u8,
    get_u16,
    put_data,
    put_gzip_string,
    put_string,
};

/// Literal protocol name carried by every Connect packet.
pub const PROTOCOL_NAME: &str = "GOSOC";
/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Four-bit packet type from the fixed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnAck = 2,
    PingReq = 3,
    PingResp = 4,
    Disconnect = 5,
    SendReq = 6,
    SendResp = 7,
}

impl MessageType {
    pub(crate) fn from_nibble(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::PingReq),
            4 => Ok(Self::PingResp),
            5 => Ok(Self::Disconnect),
            6 => Ok(Self::SendReq),
            7 => Ok(Self::SendResp),
            value => Err(ProtocolError::BadMessageType { value }),
        }
    }
}

/// Fixed header: packet type, four flag bits, and the body length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixHeader {
    pub msg_type: MessageType,
    pub flags: u8,
    pub remaining_len: u32,
}

/// Handshake result carried by ConnAck.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0,
    ServerUnavailable = 1,
    BadLoginInfo = 2,
    NotAuthorized = 3,
    AlreadyConnected = 4,
    ConcurrentLogin = 5,
    BadToken = 6,
    InvalidUid = 7,
}

impl ReturnCode {
    pub(crate) fn from_byte(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::ServerUnavailable),
            2 => Ok(Self::BadLoginInfo),
            3 => Ok(Self::NotAuthorized),
            4 => Ok(Self::AlreadyConnected),
            5 => Ok(Self::ConcurrentLogin),
            6 => Ok(Self::BadToken),
            7 => Ok(Self::InvalidUid),
            value => Err(ProtocolError::BadReturnCode { value }),
        }
    }

    /// Short human-readable reason, paired with the code on the enum itself
    /// so the two can never drift apart.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Accepted => "connection accepted",
            Self::ServerUnavailable => "server unavailable",
            Self::BadLoginInfo => "bad login info",
            Self::NotAuthorized => "not authorized",
            Self::AlreadyConnected => "already connected",
            Self::ConcurrentLogin => "concurrent login",
            Self::BadToken => "bad token",
            Self::InvalidUid => "invalid uid",
        }
    }

    #[must_use]
    pub fn is_accepted(self) -> bool { self == Self::Accepted }
}

/// Whether a SendReq expects a correlated SendResp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyLevel {
    /// Fire-and-forget; no response is ever produced.
    NoReply = 0,
    /// The server answers with a SendResp carrying the same message id.
    ReplyLater = 1,
}

/// One-byte discriminator in a Disconnect body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectKind {
    /// Ordinary client-initiated teardown.
    Normal = 0,
    /// Server-initiated removal of an older session for the same uid.
    KickOut = 1,
}

/// Per-connection protocol parameters agreed at Connect time.
///
/// The server starts from `Default` (everything zero) and fills this in
/// when the first Connect decodes; the client seeds it statically before
/// dialing. Every subsequent encode and decode consults it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtocolCommon {
    pub name: String,
    pub version: u8,
    pub keep_alive_secs: u16,
    pub enable_payload_gzip: bool,
}

impl ProtocolCommon {
    /// Parameters a client offers when dialing: current protocol, 60 s
    /// keep-alive, gzip-framed payloads.
    #[must_use]
    pub fn client_default() -> Self {
        Self {
            name: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
            keep_alive_secs: 60,
            enable_payload_gzip: true,
        }
    }
}

/// Session-opening packet. The name/version/keep-alive/gzip fields seed
/// [`ProtocolCommon`] on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub keep_alive_secs: u16,
    pub enable_payload_gzip: bool,
    /// Login information, conventionally JSON.
    pub payload: String,
}

/// Handshake acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    pub return_code: ReturnCode,
}

/// Session teardown notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub kind: DisconnectKind,
}

/// A request (or server push) with an optional binary attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReq {
    pub message_id: u16,
    pub reply_level: ReplyLevel,
    /// Routing key, conventionally `controller.action`.
    pub req_type: String,
    pub payload: String,
    /// Binary attachment; sent verbatim, inflated on receipt when gzipped.
    pub data: Option<Bytes>,
}

/// Response correlated to a ReplyLater request by message id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendResp {
    pub message_id: u16,
    pub payload: String,
}

/// Tagged union over the seven packet kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    SendReq(SendReq),
    SendResp(SendResp),
}

impl Packet {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::ConnAck(_) => MessageType::ConnAck,
            Self::PingReq => MessageType::PingReq,
            Self::PingResp => MessageType::PingResp,
            Self::Disconnect(_) => MessageType::Disconnect,
            Self::SendReq(_) => MessageType::SendReq,
            Self::SendResp(_) => MessageType::SendResp,
        }
    }

    /// Header flag bits for this packet. Only SendReq uses them: bits 1..2
    /// carry the reply level and bit 3 marks a binary attachment.
    pub(crate) fn header_flags(&self) -> u8 {
        match self {
            Self::SendReq(req) => {
                let has_data = u8::from(req.data.is_some());
                ((req.reply_level as u8) << 1) | (has_data << 3)
            }
            _ => 0,
        }
    }

    pub(crate) fn encode_body(
        &self,
        common: &ProtocolCommon,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match self {
            Self::Connect(msg) => msg.encode_body(dst),
            Self::ConnAck(msg) => {
                dst.extend_from_slice(&[0, msg.return_code as u8]);
                Ok(())
            }
            Self::PingReq | Self::PingResp => Ok(()),
            Self::Disconnect(msg) => {
                dst.extend_from_slice(&[msg.kind as u8]);
                Ok(())
            }
            Self::SendReq(msg) => msg.encode_body(common, dst),
            Self::SendResp(msg) => {
                dst.extend_from_slice(&msg.message_id.to_be_bytes());
                if common.enable_payload_gzip {
                    put_gzip_string(&msg.payload, dst)?;
                } else {
                    put_string(&msg.payload, dst);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn decode_body(
        header: FixHeader,
        body: &mut Bytes,
        common: &ProtocolCommon,
    ) -> Result<Self, ProtocolError> {
        match header.msg_type {
            MessageType::Connect => Connect::decode_body(body).map(Self::Connect),
            MessageType::ConnAck => {
                let reserved = get_u8(body)?;
                if reserved != 0 {
                    return Err(ProtocolError::InvalidFlag { flags: reserved });
                }
                let return_code = ReturnCode::from_byte(get_u8(body)?)?;
                Ok(Self::ConnAck(ConnAck { return_code }))
            }
            MessageType::PingReq => Ok(Self::PingReq),
            MessageType::PingResp => Ok(Self::PingResp),
            MessageType::Disconnect => {
                let kind = match get_u8(body)? {
                    0 => DisconnectKind::Normal,
                    _ => DisconnectKind::KickOut,
                };
                Ok(Self::Disconnect(Disconnect { kind }))
            }
            MessageType::SendReq => SendReq::decode_body(header.flags, body, common).map(Self::SendReq),
            MessageType::SendResp => {
                let message_id = get_u16(body)?;
                let payload = if common.enable_payload_gzip {
                    get_gzip_string(body)?
                } else {
                    get_string(body)?
                };
                Ok(Self::SendResp(SendResp {
                    message_id,
                    payload,
                }))
            }
        }
    }
}

impl Connect {
    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        put_string(&self.protocol_name, dst);
        dst.extend_from_slice(&[self.protocol_version]);
        let flags = u8::from(self.enable_payload_gzip) << 7;
        dst.extend_from_slice(&[flags]);
        dst.extend_from_slice(&self.keep_alive_secs.to_be_bytes());
        if self.enable_payload_gzip {
            put_gzip_string(&self.payload, dst)?;
        } else {
            put_string(&self.payload, dst);
        }
        Ok(())
    }

    /// Connect decodes without prior negotiated state: its own flag byte
    /// says whether the payload is gzip-framed.
    fn decode_body(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let protocol_name = get_string(body)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(ProtocolError::InvalidProtocolName {
                name: protocol_name,
            });
        }
        let protocol_version = get_u8(body)?;
        if protocol_version > PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidProtocolVersion {
                version: protocol_version,
            });
        }
        let flags = get_u8(body)?;
        // Bit 7 is the gzip switch; everything else is reserved.
        if flags & 0x7f != 0 {
            return Err(ProtocolError::InvalidFlag { flags });
        }
        let enable_payload_gzip = flags & 0x80 != 0;
        let keep_alive_secs = get_u16(body)?;
        let payload = if enable_payload_gzip {
            get_gzip_string(body)?
        } else {
            get_string(body)?
        };
        Ok(Self {
            protocol_name,
            protocol_version,
            keep_alive_secs,
            enable_payload_gzip,
            payload,
        })
    }
}

impl SendReq {
    fn encode_body(&self, common: &ProtocolCommon, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&self.message_id.to_be_bytes());
        put_string(&self.req_type, dst);
        if common.enable_payload_gzip {
            put_gzip_string(&self.payload, dst)?;
        } else {
            put_string(&self.payload, dst);
        }
        if let Some(data) = &self.data {
            put_data(data, dst);
        }
        Ok(())
    }

    fn decode_body(
        flags: u8,
        body: &mut Bytes,
        common: &ProtocolCommon,
    ) -> Result<Self, ProtocolError> {
        let reply_level = match (flags & 0x06) >> 1 {
            0 => ReplyLevel::NoReply,
            1 => ReplyLevel::ReplyLater,
            _ => return Err(ProtocolError::InvalidFlag { flags }),
        };
        let has_data = flags & 0x08 != 0;
        let message_id = get_u16(body)?;
        let req_type = get_string(body)?;
        let payload = if common.enable_payload_gzip {
            get_gzip_string(body)?
        } else {
            get_string(body)?
        };
        let data = if has_data { Some(get_data(body)?) } else { None };
        Ok(Self {
            message_id,
            reply_level,
            req_type,
            payload,
            data,
        })
    }
}
