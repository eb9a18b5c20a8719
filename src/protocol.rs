// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode Fast
//! messages. The contents of this module are not needed for normal client or
//! server consumers of this crate, but they are exposed for the special case of
//! someone needing to implement custom client or server code.

use std::str;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::crc::CrcMode;
use crate::error::{EncodeError, FastError, FastProtocolError};

const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

/// The size of a Fast message header
pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// The largest legal Fast message id. Message ids occupy a circular
/// 31-bit space; the high bit of the wire field must be zero.
pub const FP_MSGID_MAX: u32 = (1 << 31) - 1;

/// Default cap on the size of a message data payload.
pub const FP_DEFAULT_MAX_DATA_LEN: usize = 16 * 1024 * 1024;

/// A data type representing a Fast message id that can safely be shared
/// between threads. The `next_id` associated function retrieves the next id
/// value and manages the circular message id space internally.
#[derive(Debug, Default)]
pub struct FastMessageId(AtomicU32);

impl FastMessageId {
    /// Creates a new FastMessageId
    pub fn new() -> Self {
        FastMessageId(AtomicU32::new(0x0))
    }

    #[cfg(test)]
    pub(crate) fn starting_at(value: u32) -> Self {
        FastMessageId(AtomicU32::new(value))
    }

    /// Returns the next Fast message id. Ids are allocated sequentially
    /// starting at 1; id 0 is never issued, and the counter wraps back to
    /// 1 when it would reach `FP_MSGID_MAX`.
    pub fn next_id(&self) -> u32 {
        loop {
            let current = self.0.load(Ordering::Relaxed);
            let next = if current + 1 >= FP_MSGID_MAX {
                1
            } else {
                current + 1
            };
            if self
                .0
                .compare_exchange(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl Iterator for FastMessageId {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_id())
    }
}

/// Represents the Type field of a Fast message. Currently there is only one
/// valid value, JSON.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone, Copy)]
pub enum FastMessageType {
    Json = 1,
}

/// Represents the Status field of a Fast message.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone, Copy)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

/// This type encapsulates the header of a Fast message.
#[derive(Debug, Clone)]
pub struct FastMessageHeader {
    /// The Type field of the Fast message
    msg_type: FastMessageType,
    /// The Status field of the Fast message
    status: FastMessageStatus,
    /// The Fast message identifier
    id: u32,
    /// The CRC16 check value of the Fast message data payload
    crc: u32,
    /// The length in bytes of the Fast message data payload
    data_len: usize,
}

/// Represents the metadata about a `FastMessage` data payload. This includes
/// an RPC method name and an optional timestamp in microseconds since the
/// Unix epoch. Peers that omit the timestamp are tolerated; peers that send
/// one have it preserved.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageMetaData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uts: Option<u64>,
    #[serde(default)]
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let now_micros =
            now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());

        FastMessageMetaData {
            uts: Some(now_micros),
            name: n,
        }
    }
}

/// Encapsulates the Fast message metadata and the JSON formatted message data.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageData {
    #[serde(default)]
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(n),
            d,
        }
    }
}

/// Represents a Fast message including the header fields and data payload
#[derive(Debug, Clone, PartialEq)]
pub struct FastMessage {
    /// The Type field of the Fast message
    pub msg_type: FastMessageType,
    /// The Status field of the Fast message
    pub status: FastMessageStatus,
    /// The Fast message identifier
    pub id: u32,
    /// The data payload of the Fast message
    pub data: FastMessageData,
}

impl FastMessage {
    /// Returns a `FastMessage` that represents a Fast protocol `DATA` message
    /// with the provided message identifer and data payload.
    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            data,
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `END` message
    /// with the provided message identifer. The method parameter is used in
    /// the otherwise empty data payload.
    pub fn end(msg_id: u32, method: String) -> FastMessage {
        FastMessage::end_with(msg_id, method, None)
    }

    /// Returns an `END` message whose payload carries `value` as the sole
    /// emitted item, or an empty item array when `value` is `None`.
    pub fn end_with(
        msg_id: u32,
        method: String,
        value: Option<Value>,
    ) -> FastMessage {
        let d = match value {
            Some(v) => Value::Array(vec![v]),
            None => Value::Array(vec![]),
        };
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            data: FastMessageData::new(method, d),
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `ERROR` message
    /// with the provided message identifer and data payload.
    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            data,
        }
    }

    /// Validates untyped message parts and assembles a `FastMessage`. This is
    /// the construction path for callers working from dynamic values (custom
    /// peers, test fixtures); the typed constructors above cannot produce an
    /// invalid message.
    pub fn from_parts(
        msgid: i64,
        status: u8,
        data: Value,
    ) -> Result<FastMessage, EncodeError> {
        if msgid < 0 || msgid > i64::from(FP_MSGID_MAX) {
            return Err(EncodeError::BadMsgid(msgid));
        }
        let status = FastMessageStatus::from_u8(status)
            .ok_or(EncodeError::BadStatus(status))?;
        if !data.is_object() {
            return Err(EncodeError::BadData);
        }
        let data: FastMessageData = serde_json::from_value(data)
            .map_err(|e| EncodeError::Serialize(e.to_string()))?;

        Ok(FastMessage {
            msg_type: FastMessageType::Json,
            status,
            id: msgid as u32,
            data,
        })
    }
}

/// Encode a `FastMessage` into a byte buffer using the given CRC mode.
pub fn encode_msg(
    msg: &FastMessage,
    crc_mode: CrcMode,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if msg.id > FP_MSGID_MAX {
        return Err(EncodeError::BadMsgid(i64::from(msg.id)));
    }

    let data_str = serde_json::to_string(&msg.data)
        .map_err(|e| EncodeError::Serialize(e.to_string()))?;
    let data_len = data_str.len();
    if buf.len() + FP_HEADER_SZ + data_len > buf.capacity() {
        buf.reserve(FP_HEADER_SZ + data_len);
    }
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u8(msg.msg_type as u8);
    buf.put_u8(msg.status as u8);
    buf.put_u32(msg.id);
    buf.put_u32(u32::from(crc_mode.emit(data_str.as_bytes())));
    buf.put_u32(data_len as u32);
    buf.put_slice(data_str.as_bytes());
    Ok(())
}

#[derive(Debug, Clone)]
enum DecodeState {
    Header,
    Payload(FastMessageHeader),
}

/// This type implements the functions necessary for the Fast protocol
/// framing: an encoder that serializes one message at a time, and a
/// streaming decoder that assembles messages from arbitrary chunks of the
/// inbound byte stream.
///
/// The decoder is a two-phase state machine: it accumulates the fixed-size
/// header, validates it, then accumulates `data_len` payload bytes and
/// validates the checksum and payload shape. After the first invalid
/// condition the decoder reports that error once and emits nothing further.
#[derive(Debug)]
pub struct FastRpcCodec {
    crc_mode: CrcMode,
    max_data_len: usize,
    state: DecodeState,
    failed: bool,
}

impl FastRpcCodec {
    pub fn new(crc_mode: CrcMode, max_data_len: usize) -> FastRpcCodec {
        FastRpcCodec {
            crc_mode,
            max_data_len,
            state: DecodeState::Header,
            failed: false,
        }
    }

    fn parse_header(
        &self,
        buf: &[u8],
    ) -> Result<FastMessageHeader, FastProtocolError> {
        let version = buf[FP_OFF_VERSION];
        if version != FP_VERSION_CURRENT {
            return Err(FastProtocolError::BadVersion(version));
        }
        let msg_type = FastMessageType::from_u8(buf[FP_OFF_TYPE])
            .ok_or(FastProtocolError::BadType(buf[FP_OFF_TYPE]))?;
        let status = FastMessageStatus::from_u8(buf[FP_OFF_STATUS])
            .ok_or(FastProtocolError::BadStatus(buf[FP_OFF_STATUS]))?;
        let id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        if id > FP_MSGID_MAX {
            return Err(FastProtocolError::BadMsgid(id));
        }
        let crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;
        if data_len > self.max_data_len {
            return Err(FastProtocolError::DataTooLong {
                datalen: data_len,
                max: self.max_data_len,
            });
        }

        Ok(FastMessageHeader {
            msg_type,
            status,
            id,
            crc,
            data_len,
        })
    }

    fn parse_payload(
        &self,
        header: &FastMessageHeader,
        payload: &[u8],
    ) -> Result<FastMessage, FastProtocolError> {
        if !self.crc_mode.accepts(payload, header.crc) {
            let calculated = u32::from(self.crc_mode.emit(payload));
            return Err(FastProtocolError::ChecksumMismatch {
                expected: header.crc,
                calculated,
            });
        }

        let data_str = str::from_utf8(payload).map_err(|e| {
            FastProtocolError::InvalidJson(format!(
                "payload is not valid UTF-8: {}",
                e
            ))
        })?;
        let data: FastMessageData = serde_json::from_str(data_str)
            .map_err(|e| FastProtocolError::InvalidJson(e.to_string()))?;

        if header.status == FastMessageStatus::Error {
            let shape_ok = data
                .d
                .as_object()
                .map(|o| o.contains_key("name") && o.contains_key("message"))
                .unwrap_or(false);
            if !shape_ok {
                return Err(FastProtocolError::BadErrorShape);
            }
        }

        Ok(FastMessage {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            data,
        })
    }

    fn decode_inner(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, FastProtocolError> {
        loop {
            let header = match self.state {
                DecodeState::Header => {
                    if buf.len() < FP_HEADER_SZ {
                        return Ok(None);
                    }
                    let header = self.parse_header(&buf[..FP_HEADER_SZ])?;
                    buf.advance(FP_HEADER_SZ);
                    // Reserve room for the rest of the frame so subsequent
                    // reads land in one allocation.
                    buf.reserve(header.data_len.saturating_sub(buf.len()));
                    self.state = DecodeState::Payload(header);
                    continue;
                }
                DecodeState::Payload(ref header) => {
                    if buf.len() < header.data_len {
                        return Ok(None);
                    }
                    header.clone()
                }
            };

            let payload = buf.split_to(header.data_len);
            let msg = self.parse_payload(&header, &payload)?;
            self.state = DecodeState::Header;
            return Ok(Some(msg));
        }
    }

    fn mid_message(&self, buf: &BytesMut) -> bool {
        !buf.is_empty() || matches!(self.state, DecodeState::Payload(_))
    }
}

impl Default for FastRpcCodec {
    fn default() -> Self {
        FastRpcCodec::new(CrcMode::default(), FP_DEFAULT_MAX_DATA_LEN)
    }
}

impl Decoder for FastRpcCodec {
    type Item = FastMessage;
    type Error = FastError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, FastError> {
        if self.failed {
            return Ok(None);
        }
        match self.decode_inner(buf) {
            Ok(item) => Ok(item),
            Err(e) => {
                self.failed = true;
                Err(FastError::Protocol(e))
            }
        }
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, FastError> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                if !self.failed && self.mid_message(buf) {
                    self.failed = true;
                    Err(FastError::Protocol(
                        FastProtocolError::IncompleteMessage,
                    ))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Encoder<FastMessage> for FastRpcCodec {
    type Error = FastError;

    fn encode(
        &mut self,
        msg: FastMessage,
        buf: &mut BytesMut,
    ) -> Result<(), FastError> {
        encode_msg(&msg, self.crc_mode, buf).map_err(FastError::Encode)
    }
}
