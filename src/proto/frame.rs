//! Length-prefixed framing for both serial channels.
//!
//! Control frames: `type:u32(BE) | length:u32(BE) | payload`.
//! Tty frames: `seq:u64(BE) | length:u32(BE) | payload`, where `length == 12`
//! means EOF for that sequence (an empty payload, the "goodbye" frame).

use crate::error::{AgentError, Result};

pub const CONTROL_HEADER_LEN: usize = 8;
pub const CONTROL_MAX_FRAME: usize = 64 * 1024 * 1024;

pub const TTY_HEADER_LEN: usize = 12;
pub const TTY_MAX_FRAME: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    pub fn new(msg_type: u32, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_len = CONTROL_HEADER_LEN + self.payload.len();
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one complete control frame from the front of `buf`, returning
    /// the frame and the number of bytes consumed. Returns `Ok(None)` if
    /// `buf` does not yet contain a whole frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < CONTROL_HEADER_LEN {
            return Ok(None);
        }
        let msg_type = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        if length < CONTROL_HEADER_LEN {
            return Err(AgentError::Protocol(format!(
                "control frame length {length} shorter than header"
            )));
        }
        if length > CONTROL_MAX_FRAME {
            return Err(AgentError::Protocol(format!(
                "control frame length {length} exceeds {CONTROL_MAX_FRAME}"
            )));
        }
        if buf.len() < length {
            return Ok(None);
        }
        let payload = buf[CONTROL_HEADER_LEN..length].to_vec();
        Ok(Some((ControlFrame { msg_type, payload }, length)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyFrame {
    pub seq: u64,
    pub data: Vec<u8>,
}

impl TtyFrame {
    pub fn new(seq: u64, data: Vec<u8>) -> Self {
        Self { seq, data }
    }

    pub fn goodbye(seq: u64) -> Self {
        Self { seq, data: Vec::new() }
    }

    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_len = TTY_HEADER_LEN + self.data.len();
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < TTY_HEADER_LEN {
            return Ok(None);
        }
        let seq = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let length = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        if length < TTY_HEADER_LEN {
            return Err(AgentError::Protocol(format!(
                "tty frame length {length} shorter than header"
            )));
        }
        if length > TTY_HEADER_LEN + TTY_MAX_FRAME {
            return Err(AgentError::Protocol(format!(
                "tty frame length {length} exceeds cap"
            )));
        }
        if buf.len() < length {
            return Ok(None);
        }
        let data = buf[TTY_HEADER_LEN..length].to_vec();
        Ok(Some((TtyFrame { seq, data }, length)))
    }
}

/// Splits a WRITEFILE payload into its JSON header and raw byte tail.
///
/// The split point is the first literal `}` byte anywhere in the buffer,
/// not a depth-aware JSON scan -- deliberately simple rather than "safer",
/// since the host is assumed not to put `}` inside path strings.
pub fn split_writefile_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    match payload.iter().position(|&b| b == b'}') {
        Some(idx) => Ok((&payload[..=idx], &payload[idx + 1..])),
        None => Err(AgentError::ParseError(
            "WRITEFILE payload has no JSON header".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_round_trips() {
        let frame = ControlFrame::new(3, vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        let (decoded, consumed) = ControlFrame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn control_frame_needs_more_bytes() {
        let frame = ControlFrame::new(3, vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        assert!(ControlFrame::decode(&encoded[..encoded.len() - 1])
            .unwrap()
            .is_none());
        assert!(ControlFrame::decode(&encoded[..4]).unwrap().is_none());
    }

    #[test]
    fn control_frame_rejects_oversized_length() {
        let mut buf = vec![0u8; 8];
        buf[4..8].copy_from_slice(&((CONTROL_MAX_FRAME + 1) as u32).to_be_bytes());
        assert!(ControlFrame::decode(&buf).is_err());
    }

    #[test]
    fn tty_frame_round_trips() {
        let frame = TtyFrame::new(42, b"hello\n".to_vec());
        let encoded = frame.encode();
        let (decoded, consumed) = TtyFrame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn tty_frame_goodbye_is_eof() {
        let frame = TtyFrame::goodbye(99);
        assert!(frame.is_eof());
        assert_eq!(frame.encode().len(), TTY_HEADER_LEN);
    }

    #[test]
    fn writefile_split_on_first_brace() {
        let payload = br#"{"path":"/x"}rest of the bytes}"#;
        let (header, tail) = split_writefile_payload(payload).unwrap();
        assert_eq!(header, br#"{"path":"/x"}"#);
        assert_eq!(tail, b"rest of the bytes}");
    }

    #[test]
    fn writefile_split_requires_closing_brace() {
        assert!(split_writefile_payload(b"no brace here").is_err());
    }
}
