// control-server/src/ws/frame.rs
use thiserror::Error;

/// Largest frame payload the control channel accepts. Control traffic is
/// small JSON; anything past this is a broken or hostile peer.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Violations of the base framing rules. Any of these tears the
/// connection down; there is no recovery once framing is off the rails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved opcode 0x{0:x}")]
    ReservedOpcode(u8),
    #[error("reserved header bits set")]
    ReservedBits,
    #[error("continuation frame without a preceding fragment")]
    UnexpectedContinuation,
    #[error("fragmented data frames are not supported on this channel")]
    FragmentedDataFrame,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload exceeds 125 bytes")]
    OversizedControlFrame,
    #[error("frame payload of {0} bytes exceeds the channel limit")]
    PayloadTooLarge(u64),
    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn as_bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One decoded frame. Payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Try to decode one frame from the front of `buffer`.
///
/// `Ok(None)` means the buffer holds a prefix of a valid frame and more
/// bytes are needed; consumed bytes are drained only on a full decode.
/// Masked and unmasked payloads are both accepted (browsers always mask,
/// but the channel does not enforce it).
pub fn decode_frame(buffer: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
    if buffer.len() < 2 {
        return Ok(None);
    }

    let first = buffer[0];
    let second = buffer[1];

    let fin = first & 0x80 != 0;
    if first & 0x70 != 0 {
        // No extensions negotiated, so RSV bits must be clear
        return Err(FrameError::ReservedBits);
    }

    let opcode_bits = first & 0x0F;
    let opcode = Opcode::from_bits(opcode_bits).ok_or(FrameError::ReservedOpcode(opcode_bits))?;

    let len7 = second & 0x7F;
    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControlFrame);
        }
        if len7 > 125 {
            return Err(FrameError::OversizedControlFrame);
        }
    } else {
        if opcode == Opcode::Continuation {
            return Err(FrameError::UnexpectedContinuation);
        }
        if !fin {
            return Err(FrameError::FragmentedDataFrame);
        }
    }

    let masked = second & 0x80 != 0;
    let mut offset = 2usize;

    let payload_len: u64 = match len7 {
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
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buffer[2..10]);
            offset += 8;
            u64::from_be_bytes(bytes)
        }
        len => len as u64,
    };

    if payload_len > MAX_FRAME_PAYLOAD as u64 {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }

    let mask_key = if masked {
        if buffer.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset + payload_len as usize;
    if buffer.len() < total {
        return Ok(None);
    }

    let mut payload = buffer[offset..total].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    buffer.drain(..total);

    Ok(Some(Frame { opcode, payload }))
}

/// Encode one server frame. Server frames are final and unmasked.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | opcode.as_bits());

    let len = payload.len();
    if len < 126 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Encode a close frame with a status code and reason text.
pub fn close_frame(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(Opcode::Close, &payload)
}

/// Status code carried by a close payload, if the peer sent one.
pub fn close_code(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([payload[0], payload[1]]))
}
