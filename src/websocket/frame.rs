//! RFC 6455 frame codec.
//!
//! # Responsibilities
//! - Encode and decode single frames (2 to 14 byte headers, masking)
//! - Split outgoing messages into fragments
//! - Reassemble incoming fragments, with control frames handled out-of-band
//! - Close payload encoding and the close code taxonomy
//!
//! Encoding and decoding are free functions without state. The only state
//! is [`FragmentQueue`], owned by one socket.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

pub const WS_MIN_HEADER: usize = 2;
pub const WS_MAX_HEADER: usize = 14;
pub const WS_FRAGMENT_MINIMUM: usize = 4096 - WS_MAX_HEADER;
pub const WS_FRAGMENT_DEFAULT: usize = 4 * 4096 - WS_MAX_HEADER;
pub const WS_FRAGMENT_MAXIMUM: usize = 256 * 4096 - WS_MAX_HEADER;
/// Milliseconds between keepalive pings.
pub const WS_KEEPALIVE_TIME: u64 = 7000;
/// Milliseconds to wait for a pong.
pub const WS_PING_TIMEOUT: u64 = 5000;
/// Largest payload a control frame may carry.
pub const WS_MAX_CONTROL_PAYLOAD: usize = 125;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOINGAWAY: u16 = 1001;
pub const CLOSE_BYERROR: u16 = 1002;
pub const CLOSE_TERMINATE: u16 = 1003;
pub const CLOSE_RESERVED: u16 = 1004;
/// Never sent; reported when a close frame carried no code.
pub const CLOSE_NOCLOSE: u16 = 1005;
/// Never sent; reported when the transport dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_DATA: u16 = 1007;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_TOOBIG: u16 = 1009;
pub const CLOSE_NOEXTENSION: u16 = 1010;
pub const CLOSE_CONDITION: u16 = 1011;
/// Never sent; TLS handshake failure.
pub const CLOSE_SECURE: u16 = 1015;

pub const CLOSE_MAX_PROTOCOL: u16 = 2999;
pub const CLOSE_MAX_IANA: u16 = 3999;
pub const CLOSE_MAX_PRIVATE: u16 = 4999;

/// Frame opcode. Reserved values are kept so they can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0 => Opcode::Continuation,
            1 => Opcode::Text,
            2 => Opcode::Binary,
            8 => Opcode::Close,
            9 => Opcode::Ping,
            10 => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
            Opcode::Reserved(value) => value & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() >= 8
    }
}

/// One decoded frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved opcode {0}")]
    ReservedOpcode(u8),
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    MessageInterrupted,
    #[error("unmasked frame from client")]
    Unmasked,
    #[error("message of {size} bytes exceeds limit of {max}")]
    TooBig { size: usize, max: usize },
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// Close code to answer this error with.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooBig { .. } => CLOSE_TOOBIG,
            FrameError::InvalidUtf8 => CLOSE_DATA,
            _ => CLOSE_BYERROR,
        }
    }
}

/// A fresh random masking key.
pub fn mask_key() -> [u8; 4] {
    fastrand::u32(..).to_be_bytes()
}

/// XOR `data` in place with the 4-byte key.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode one frame onto the wire.
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Bytes {
    let len = payload.len();
    let mut out = BytesMut::with_capacity(len + WS_MAX_HEADER);
    out.put_u8(((fin as u8) << 7) | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len <= 125 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.put_slice(payload),
    }
    out.freeze()
}

/// Encode a complete frame value, re-using its mask and flags.
pub fn encode(frame: &Frame) -> Bytes {
    encode_frame(frame.opcode, &frame.payload, frame.fin, frame.mask)
}

/// Decode one frame from the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and
/// the number of bytes it occupied. Payloads larger than `max_payload` are
/// refused from the header alone.
pub fn decode_frame(buffer: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buffer.len() < WS_MIN_HEADER {
        return Ok(None);
    }
    let first = buffer[0];
    let second = buffer[1];
    let masked = second & 0x80 != 0;

    let mut offset = WS_MIN_HEADER;
    let len = match second & 0x7F {
        126 => {
            if buffer.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buffer[2], buffer[3]]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buffer.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            offset += 8;
            u64::from_be_bytes(raw)
        }
        short => u64::from(short),
    };
    if len > max_payload as u64 {
        return Err(FrameError::TooBig {
            size: usize::try_from(len).unwrap_or(usize::MAX),
            max: max_payload,
        });
    }
    let len = len as usize;

    let mask = if masked {
        if buffer.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buffer[offset], buffer[offset + 1], buffer[offset + 2], buffer[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buffer.len() < offset + len {
        return Ok(None);
    }
    let mut payload = BytesMut::from(&buffer[offset..offset + len]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin: first & 0x80 != 0,
        rsv1: first & 0x40 != 0,
        rsv2: first & 0x20 != 0,
        rsv3: first & 0x10 != 0,
        opcode: Opcode::from_u8(first),
        mask,
        payload: payload.freeze(),
    };
    Ok(Some((frame, offset + len)))
}

/// Protocol checks a server applies to every frame it receives.
pub fn validate_frame(frame: &Frame, require_mask: bool) -> Result<(), FrameError> {
    if let Opcode::Reserved(value) = frame.opcode {
        return Err(FrameError::ReservedOpcode(value));
    }
    if frame.rsv1 || frame.rsv2 || frame.rsv3 {
        return Err(FrameError::ReservedBits);
    }
    if frame.opcode.is_control() {
        if !frame.fin {
            return Err(FrameError::FragmentedControl);
        }
        if frame.payload.len() > WS_MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlTooLong(frame.payload.len()));
        }
    }
    if require_mask && !frame.is_masked() {
        return Err(FrameError::Unmasked);
    }
    Ok(())
}

/// Clamp a configured fragment size into the supported range.
pub fn clamp_fragment_size(size: usize) -> usize {
    size.clamp(WS_FRAGMENT_MINIMUM, WS_FRAGMENT_MAXIMUM)
}

/// Encode a message as one or more frames of at most `fragment_size`
/// payload bytes each. Client-side callers pass `mask = true`.
pub fn fragment_message(opcode: Opcode, payload: &[u8], fragment_size: usize, mask: bool) -> Vec<Bytes> {
    let fragment_size = fragment_size.max(1);
    if payload.len() <= fragment_size {
        return vec![encode_frame(opcode, payload, true, mask.then(mask_key))];
    }
    let chunks: Vec<&[u8]> = payload.chunks(fragment_size).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let code = if i == 0 { opcode } else { Opcode::Continuation };
            encode_frame(code, chunk, i == last, mask.then(mask_key))
        })
        .collect()
}

/// Build a close payload: big-endian code plus UTF-8 reason, trimmed so
/// the frame stays within the control frame limit.
pub fn encode_close_payload(code: u16, reason: &str) -> Bytes {
    let code = match code {
        CLOSE_NOCLOSE | CLOSE_ABNORMAL | CLOSE_SECURE => CLOSE_NORMAL,
        other => other,
    };
    let mut out = BytesMut::with_capacity(2 + reason.len());
    out.put_u16(code);
    let mut end = reason.len().min(WS_MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    out.put_slice(&reason.as_bytes()[..end]);
    out.freeze()
}

/// Decode a close payload. An empty payload reports `CLOSE_NOCLOSE`.
pub fn decode_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (CLOSE_NOCLOSE, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

/// Whether a peer may legitimately send `code`.
pub fn is_valid_close_code(code: u16) -> bool {
    match code {
        CLOSE_NORMAL..=CLOSE_CONDITION => {
            !matches!(code, CLOSE_RESERVED | CLOSE_NOCLOSE | CLOSE_ABNORMAL)
        }
        3000..=CLOSE_MAX_PRIVATE => true,
        _ => false,
    }
}

/// Incoming fragments of the message currently being received.
#[derive(Debug)]
pub struct FragmentQueue {
    fragments: VecDeque<Bytes>,
    opcode: Option<Opcode>,
    size: usize,
    max_message: usize,
}

impl FragmentQueue {
    pub fn new(max_message: usize) -> Self {
        Self {
            fragments: VecDeque::new(),
            opcode: None,
            size: 0,
            max_message,
        }
    }

    /// Store a data frame. Returns the opcode and payload of a complete
    /// message once its final fragment arrives. Control frames must not be
    /// passed here.
    pub fn push(&mut self, frame: Frame) -> Result<Option<(Opcode, Bytes)>, FrameError> {
        match (frame.opcode, self.opcode) {
            (Opcode::Continuation, None) => return Err(FrameError::UnexpectedContinuation),
            (Opcode::Continuation, Some(_)) => {}
            (_, Some(_)) => return Err(FrameError::MessageInterrupted),
            (opcode, None) => self.opcode = Some(opcode),
        }

        self.size += frame.payload.len();
        if self.size > self.max_message {
            let size = self.size;
            self.clear();
            return Err(FrameError::TooBig {
                size,
                max: self.max_message,
            });
        }
        self.fragments.push_back(frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.opcode.unwrap_or(Opcode::Binary);
        let message = if self.fragments.len() == 1 {
            self.fragments.pop_front().unwrap_or_default()
        } else {
            let mut joined = BytesMut::with_capacity(self.size);
            for part in self.fragments.drain(..) {
                joined.put_slice(&part);
            }
            joined.freeze()
        };
        self.clear();
        Ok(Some((opcode, message)))
    }

    /// Fragments held for the message in progress.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.opcode = None;
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    fn decode_all(wire: &[u8]) -> Frame {
        let (frame, used) = decode_frame(wire, MAX).unwrap().unwrap();
        assert_eq!(used, wire.len());
        frame
    }

    #[test]
    fn test_length_class_boundaries() {
        for (len, header) in [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for mask in [None, Some([1, 2, 3, 4])] {
                let wire = encode_frame(Opcode::Binary, &payload, true, mask);
                let expected = header + if mask.is_some() { 4 } else { 0 } + len;
                assert_eq!(wire.len(), expected, "len {len}");
                let frame = decode_all(&wire);
                assert_eq!(frame.payload.as_ref(), payload.as_slice());
                assert_eq!(frame.opcode, Opcode::Binary);
                assert_eq!(frame.mask, mask);
                assert!(frame.fin);
            }
        }
    }

    #[test]
    fn test_masking_changes_wire_bytes() {
        let wire = encode_frame(Opcode::Text, b"abcd", true, Some([0xFF, 0, 0xFF, 0]));
        assert_eq!(&wire[6..], &[b'a' ^ 0xFF, b'b', b'c' ^ 0xFF, b'd']);
        assert_eq!(wire[1] & 0x80, 0x80);
    }

    #[test]
    fn test_partial_buffer_needs_more() {
        let wire = encode_frame(Opcode::Text, &[7u8; 300], true, Some(mask_key()));
        assert!(decode_frame(&wire[..1], MAX).unwrap().is_none());
        assert!(decode_frame(&wire[..3], MAX).unwrap().is_none());
        assert!(decode_frame(&wire[..6], MAX).unwrap().is_none());
        assert!(decode_frame(&wire[..wire.len() - 1], MAX).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected_from_header() {
        let wire = encode_frame(Opcode::Binary, &[0u8; 200], true, None);
        let error = decode_frame(&wire[..4], 100).unwrap_err();
        assert_eq!(error.close_code(), CLOSE_TOOBIG);
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let frames = fragment_message(Opcode::Binary, &payload, WS_FRAGMENT_MINIMUM, true);
        assert_eq!(frames.len(), 3);

        let mut queue = FragmentQueue::new(MAX);
        let mut complete = None;
        for (i, wire) in frames.iter().enumerate() {
            let frame = decode_all(wire);
            assert_eq!(frame.fin, i == 2);
            if i > 0 {
                assert_eq!(frame.opcode, Opcode::Continuation);
            }
            complete = queue.push(frame).unwrap();
            if i < 2 {
                assert!(complete.is_none());
                assert_eq!(queue.len(), i + 1);
            }
        }
        let (opcode, message) = complete.unwrap();
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(message.as_ref(), payload.as_slice());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_control_frame_between_fragments() {
        let mut queue = FragmentQueue::new(MAX);
        let mut first = Frame::new(Opcode::Text, "hel");
        first.fin = false;
        assert!(queue.push(first).unwrap().is_none());

        let ping = decode_all(&encode_frame(Opcode::Ping, b"p", true, None));
        assert!(ping.opcode.is_control());
        assert!(validate_frame(&ping, false).is_ok());
        assert!(queue.in_progress());

        let last = Frame::new(Opcode::Continuation, "lo");
        let (opcode, message) = queue.push(last).unwrap().unwrap();
        assert_eq!(opcode, Opcode::Text);
        assert_eq!(message.as_ref(), b"hello");
    }

    #[test]
    fn test_fragment_sequence_errors() {
        let mut queue = FragmentQueue::new(MAX);
        assert_eq!(
            queue.push(Frame::new(Opcode::Continuation, "x")),
            Err(FrameError::UnexpectedContinuation)
        );
        let mut first = Frame::new(Opcode::Text, "a");
        first.fin = false;
        queue.push(first).unwrap();
        assert_eq!(
            queue.push(Frame::new(Opcode::Binary, "b")),
            Err(FrameError::MessageInterrupted)
        );
    }

    #[test]
    fn test_message_size_limit() {
        let mut queue = FragmentQueue::new(4);
        let mut first = Frame::new(Opcode::Binary, "abc");
        first.fin = false;
        queue.push(first).unwrap();
        let error = queue.push(Frame::new(Opcode::Continuation, "de")).unwrap_err();
        assert_eq!(error.close_code(), CLOSE_TOOBIG);
        assert!(!queue.in_progress());
    }

    #[test]
    fn test_validate_frame() {
        let mut frame = Frame::new(Opcode::Reserved(3), "");
        assert_eq!(validate_frame(&frame, false), Err(FrameError::ReservedOpcode(3)));
        frame = Frame::new(Opcode::Text, "x");
        frame.rsv1 = true;
        assert_eq!(validate_frame(&frame, false), Err(FrameError::ReservedBits));
        frame = Frame::new(Opcode::Ping, vec![0u8; 126]);
        assert_eq!(validate_frame(&frame, false), Err(FrameError::ControlTooLong(126)));
        frame = Frame::new(Opcode::Close, "");
        frame.fin = false;
        assert_eq!(validate_frame(&frame, false), Err(FrameError::FragmentedControl));
        frame = Frame::new(Opcode::Text, "x");
        assert_eq!(validate_frame(&frame, true), Err(FrameError::Unmasked));
    }

    #[test]
    fn test_close_payload() {
        let payload = encode_close_payload(CLOSE_GOINGAWAY, "bye");
        assert_eq!(decode_close_payload(&payload), (CLOSE_GOINGAWAY, "bye".to_string()));
        assert_eq!(decode_close_payload(&[]), (CLOSE_NOCLOSE, String::new()));
        let never_sent = encode_close_payload(CLOSE_ABNORMAL, "");
        assert_eq!(decode_close_payload(&never_sent).0, CLOSE_NORMAL);
        let long = "é".repeat(100);
        assert!(encode_close_payload(CLOSE_NORMAL, &long).len() <= WS_MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn test_close_code_ranges() {
        assert!(is_valid_close_code(CLOSE_NORMAL));
        assert!(is_valid_close_code(CLOSE_CONDITION));
        assert!(!is_valid_close_code(CLOSE_NOCLOSE));
        assert!(!is_valid_close_code(CLOSE_SECURE));
        assert!(is_valid_close_code(CLOSE_MAX_IANA));
        assert!(is_valid_close_code(CLOSE_MAX_PRIVATE));
        assert!(!is_valid_close_code(CLOSE_MAX_PROTOCOL));
        assert!(!is_valid_close_code(5000));
    }

    #[test]
    fn test_fragment_size_clamp() {
        assert_eq!(clamp_fragment_size(10), WS_FRAGMENT_MINIMUM);
        assert_eq!(clamp_fragment_size(usize::MAX), WS_FRAGMENT_MAXIMUM);
        assert_eq!(clamp_fragment_size(WS_FRAGMENT_DEFAULT), WS_FRAGMENT_DEFAULT);
    }
}
