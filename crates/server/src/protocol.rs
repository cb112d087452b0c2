// Wire framing for the sync protocol.
//
// Every frame opens with a message-type byte: `0` = sync, `1` = awareness.
// Sync frames carry a subtype byte and one varuint-length-prefixed payload
// (an opaque state vector for step-1, an opaque update for step-2/update).
// Awareness frames have no structure at this layer; the relay forwards the
// original bytes verbatim.

pub const MSG_SYNC: u8 = 0;
pub const MSG_AWARENESS: u8 = 1;

const SYNC_STEP1: u8 = 0;
const SYNC_STEP2: u8 = 1;
const SYNC_UPDATE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// "Here is what I have seen" — an encoded state vector.
    Step1,
    /// "Here is what you are missing" — the diff answering a step-1.
    Step2,
    /// An incremental update outside the handshake.
    Update,
}

impl SyncKind {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Step1 => SYNC_STEP1,
            Self::Step2 => SYNC_STEP2,
            Self::Update => SYNC_UPDATE,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SYNC_STEP1 => Some(Self::Step1),
            SYNC_STEP2 => Some(Self::Step2),
            SYNC_UPDATE => Some(Self::Update),
            _ => None,
        }
    }
}

/// A decoded inbound frame.
///
/// There is no error channel in this protocol, so anything the codec cannot
/// make sense of — empty input, truncated length prefix, unknown type or
/// subtype byte — decodes to [`Frame::Malformed`] and is dropped without a
/// reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync { kind: SyncKind, payload: Vec<u8> },
    Awareness(Vec<u8>),
    Malformed,
}

impl Frame {
    pub fn decode(data: &[u8]) -> Frame {
        let Some((&msg_type, rest)) = data.split_first() else {
            return Frame::Malformed;
        };

        match msg_type {
            MSG_SYNC => {
                let Some((&subtype, rest)) = rest.split_first() else {
                    return Frame::Malformed;
                };
                let Some(kind) = SyncKind::from_byte(subtype) else {
                    return Frame::Malformed;
                };
                let Some((len, consumed)) = read_var_u64(rest) else {
                    return Frame::Malformed;
                };
                let Ok(len) = usize::try_from(len) else {
                    return Frame::Malformed;
                };
                // Trailing bytes past the declared payload are ignored.
                let Some(payload) = consumed.checked_add(len).and_then(|end| rest.get(consumed..end))
                else {
                    return Frame::Malformed;
                };
                Frame::Sync { kind, payload: payload.to_vec() }
            }
            MSG_AWARENESS => Frame::Awareness(rest.to_vec()),
            _ => Frame::Malformed,
        }
    }
}

pub fn encode_sync(kind: SyncKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.push(MSG_SYNC);
    out.push(kind.as_byte());
    write_var_u64(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

pub fn encode_awareness(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(MSG_AWARENESS);
    out.extend_from_slice(payload);
    out
}

/// Append `value` as a varuint: 7 bits per byte, low-order group first,
/// continuation bit `0x80` set on every byte but the last.
pub fn write_var_u64(out: &mut Vec<u8>, mut value: u64) {
    while value > 0x7f {
        out.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read a varuint from the front of `data`, returning the value and the
/// number of bytes consumed, or `None` if the encoding is truncated.
pub fn read_var_u64(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (index, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
        shift += 7;
    }
    None
}
