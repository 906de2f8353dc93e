//! Control protocol types and wire encoding.
//!
//! Every message is one sequenced-packet datagram, so there is no length
//! prefix framing on top of the socket. All integers are little-endian and
//! the layout has no padding.
//!
//! Request (client → broker):
//!
//! ```text
//! [u8: version][u8: opcode][u16 LE: total_len][u32 LE: param][name bytes … \0]
//! ```
//!
//! `total_len` covers the whole datagram (8-byte header plus the name
//! including its terminator). `param` is a capacity hint handed to the
//! registry untouched.
//!
//! Response (broker → client):
//!
//! ```text
//! [u8: version][u8: status][u16 LE: total_len = 4]
//! ```
//!
//! On success the response datagram also carries exactly one descriptor as
//! `SOL_SOCKET`/`SCM_RIGHTS` ancillary data.

use std::fmt;

use super::error::{BrokerError, BrokerResult, Status};
use crate::constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, REQUEST_HEADER_SIZE, RESPONSE_SIZE};

// ─── Opcodes ───────────────────────────────────────────────────────────────

/// Opcode byte constants for the control protocol.
pub mod opcode {
    /// The evidenced opcode: open-or-create the named channel and attach.
    pub const W: u8 = b'W';
}

/// Closed set of operations the broker understands.
///
/// Only one opcode is known to exist on the wire; its exact meaning beyond
/// "attach to the named channel, creating it if needed" is not documented,
/// so the variant keeps the wire letter as its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opcode `'W'` (0x57): resolve or create the channel, acquire it and
    /// hand its descriptor to the caller.
    OpcodeW,
}

impl Operation {
    /// Map a wire opcode onto the operation set.
    pub fn from_opcode(byte: u8) -> BrokerResult<Self> {
        match byte {
            opcode::W => Ok(Self::OpcodeW),
            other => Err(BrokerError::UnsupportedOperation(other)),
        }
    }

    /// Wire opcode of this operation.
    pub fn opcode(self) -> u8 {
        match self {
            Self::OpcodeW => opcode::W,
        }
    }
}

// ─── Channel name ──────────────────────────────────────────────────────────

/// Opaque channel key, stored without its wire terminator.
///
/// Names are URI-shaped by convention (`smbcast://test.0`) but the broker
/// only ever compares them byte-for-byte.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(Vec<u8>);

impl ChannelName {
    /// Build a name from raw bytes (without terminator).
    ///
    /// Rejects empty names and names containing NUL, since neither can be
    /// represented on the wire.
    pub fn new(bytes: impl Into<Vec<u8>>) -> BrokerResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(BrokerError::MalformedMessage("empty channel name".into()));
        }
        if bytes.contains(&0) {
            return Err(BrokerError::MalformedMessage(
                "channel name contains an interior NUL".into(),
            ));
        }
        if bytes.len() > MAX_NAME_LEN {
            return Err(BrokerError::MalformedMessage(format!(
                "channel name is {} bytes, limit is {MAX_NAME_LEN}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Name bytes without terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Name bytes with the trailing NUL, as sent on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + 1);
        out.extend_from_slice(&self.0);
        out.push(0);
        out
    }

    /// The scheme prefix (`smbcast` for `smbcast://…`), if the name has one.
    pub fn scheme(&self) -> Option<&[u8]> {
        self.0
            .windows(3)
            .position(|w| w == b"://")
            .map(|idx| &self.0[..idx])
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelName({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl TryFrom<&str> for ChannelName {
    type Error = BrokerError;

    fn try_from(value: &str) -> BrokerResult<Self> {
        Self::new(value.as_bytes())
    }
}

// ─── Request ───────────────────────────────────────────────────────────────

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Protocol version; always [`PROTOCOL_VERSION`] once decoded.
    pub version: u8,
    /// Requested operation.
    pub operation: Operation,
    /// Capacity hint, interpreted by the registry.
    pub param: u32,
    /// Channel the request targets.
    pub name: ChannelName,
}

impl ControlRequest {
    /// Build a request for the current protocol version.
    pub fn new(operation: Operation, param: u32, name: ChannelName) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation,
            param,
            name,
        }
    }

    /// Encode to one wire datagram.
    pub fn encode(&self) -> Vec<u8> {
        encode_request(self.version, self.operation.opcode(), self.param, &self.name.to_wire())
    }

    /// Decode one received datagram.
    ///
    /// Checks are applied in wire order: header length, version, declared
    /// length, opcode, then the name.
    pub fn decode(datagram: &[u8]) -> BrokerResult<Self> {
        if datagram.len() < REQUEST_HEADER_SIZE {
            return Err(BrokerError::MalformedMessage(format!(
                "request too short: {} bytes, header needs {REQUEST_HEADER_SIZE}",
                datagram.len()
            )));
        }

        let version = datagram[0];
        if version != PROTOCOL_VERSION {
            return Err(BrokerError::MalformedMessage(format!(
                "unsupported protocol version {version}"
            )));
        }

        let total_len = u16::from_le_bytes([datagram[2], datagram[3]]) as usize;
        if total_len != datagram.len() {
            return Err(BrokerError::MalformedMessage(format!(
                "declared length {total_len} does not match {} bytes read",
                datagram.len()
            )));
        }

        let operation = Operation::from_opcode(datagram[1])?;
        let param = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);

        let raw_name = &datagram[REQUEST_HEADER_SIZE..];
        let Some((&0, name)) = raw_name.split_last() else {
            return Err(BrokerError::MalformedMessage(
                "channel name is not NUL-terminated".into(),
            ));
        };
        let name = ChannelName::new(name)?;

        Ok(Self {
            version,
            operation,
            param,
            name,
        })
    }
}

/// Encode a request datagram from raw parts.
///
/// `name` is written verbatim, so the caller decides whether it carries a
/// terminator. `total_len` is always computed from the actual size.
pub fn encode_request(version: u8, opcode: u8, param: u32, name: &[u8]) -> Vec<u8> {
    let total_len = (REQUEST_HEADER_SIZE + name.len()) as u16;
    let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + name.len());
    buf.push(version);
    buf.push(opcode);
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.extend_from_slice(&param.to_le_bytes());
    buf.extend_from_slice(name);
    buf
}

/// Longest channel name (without terminator) that fits in one request.
pub const MAX_NAME_LEN: usize = MAX_MESSAGE_SIZE - REQUEST_HEADER_SIZE - 1;

// ─── Response ──────────────────────────────────────────────────────────────

/// Fixed-size status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Protocol version echoed to the client.
    pub version: u8,
    /// Outcome of the request.
    pub status: Status,
}

impl ControlResponse {
    /// Response for the current protocol version.
    pub fn new(status: Status) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status,
        }
    }

    /// Encode to the 4-byte wire header.
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let len = (RESPONSE_SIZE as u16).to_le_bytes();
        [self.version, self.status.as_u8(), len[0], len[1]]
    }

    /// Decode a response datagram (client side).
    pub fn decode(datagram: &[u8]) -> BrokerResult<Self> {
        if datagram.len() != RESPONSE_SIZE {
            return Err(BrokerError::MalformedMessage(format!(
                "response must be {RESPONSE_SIZE} bytes, got {}",
                datagram.len()
            )));
        }
        let total_len = u16::from_le_bytes([datagram[2], datagram[3]]) as usize;
        if total_len != RESPONSE_SIZE {
            return Err(BrokerError::MalformedMessage(format!(
                "response declares {total_len} bytes"
            )));
        }
        let status = Status::from_u8(datagram[1]).ok_or_else(|| {
            BrokerError::MalformedMessage(format!("unknown status byte {}", datagram[1]))
        })?;
        Ok(Self {
            version: datagram[0],
            status,
        })
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn observed_request() -> Vec<u8> {
        // Byte-for-byte what the reference client sends.
        let mut msg = vec![0x02, b'W', 25, 0, 0x00, 0x04, 0x00, 0x00];
        msg.extend_from_slice(b"smbcast://test.0\x00");
        msg
    }

    #[test]
    fn decodes_observed_client_request() {
        let req = ControlRequest::decode(&observed_request()).unwrap();
        assert_eq!(req.version, 2);
        assert_eq!(req.operation, Operation::OpcodeW);
        assert_eq!(req.param, 1024);
        assert_eq!(req.name.as_bytes(), b"smbcast://test.0");
    }

    #[test]
    fn encode_matches_observed_layout() {
        let name = ChannelName::try_from("smbcast://test.0").unwrap();
        let req = ControlRequest::new(Operation::OpcodeW, 1024, name);
        assert_eq!(req.encode(), observed_request());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut msg = observed_request();
        msg[2] = 30;
        let err = ControlRequest::decode(&msg).unwrap_err();
        assert_eq!(err.status(), Status::MalformedMessage);

        // Extra trailing byte beyond the declared length.
        let mut msg = observed_request();
        msg.push(0);
        let err = ControlRequest::decode(&msg).unwrap_err();
        assert_eq!(err.status(), Status::MalformedMessage);
    }

    #[test]
    fn rejects_short_header() {
        let err = ControlRequest::decode(&[0x02, b'W', 4, 0]).unwrap_err();
        assert_eq!(err.status(), Status::MalformedMessage);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut msg = observed_request();
        msg[0] = 0x01;
        let err = ControlRequest::decode(&msg).unwrap_err();
        assert_eq!(err.status(), Status::MalformedMessage);
    }

    #[test]
    fn rejects_missing_terminator() {
        let msg = encode_request(2, b'W', 1024, b"smbcast://test.0");
        let err = ControlRequest::decode(&msg).unwrap_err();
        assert_eq!(err.status(), Status::MalformedMessage);
    }

    #[test]
    fn rejects_empty_and_embedded_nul_names() {
        let msg = encode_request(2, b'W', 0, b"\x00");
        assert_eq!(
            ControlRequest::decode(&msg).unwrap_err().status(),
            Status::MalformedMessage
        );

        let msg = encode_request(2, b'W', 0, b"smb\x00cast\x00");
        assert_eq!(
            ControlRequest::decode(&msg).unwrap_err().status(),
            Status::MalformedMessage
        );
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        let msg = encode_request(2, b'X', 1024, b"smbcast://test.0\x00");
        let err = ControlRequest::decode(&msg).unwrap_err();
        assert_eq!(err.status(), Status::UnsupportedOperation);
    }

    #[test]
    fn response_layout() {
        let resp = ControlResponse::new(Status::Success);
        assert_eq!(resp.encode(), [2, 0, 4, 0]);

        let decoded = ControlResponse::decode(&[2, 2, 4, 0]).unwrap();
        assert_eq!(decoded.status, Status::UnsupportedOperation);

        assert!(ControlResponse::decode(&[2, 0, 4]).is_err());
        assert!(ControlResponse::decode(&[2, 42, 4, 0]).is_err());
    }

    #[test]
    fn scheme_is_prefix_before_separator() {
        let name = ChannelName::try_from("smbcast://test.0").unwrap();
        assert_eq!(name.scheme(), Some(&b"smbcast"[..]));

        let bare = ChannelName::try_from("plain-name").unwrap();
        assert_eq!(bare.scheme(), None);
    }

    #[test]
    fn oversized_name_is_rejected() {
        let long = vec![b'a'; MAX_NAME_LEN + 1];
        assert!(ChannelName::new(long).is_err());
        assert!(ChannelName::new(vec![b'a'; MAX_NAME_LEN]).is_ok());
    }
}
