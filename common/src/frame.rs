use log::warn;

pub const FRAME_CAPACITY: usize = 128;
pub const TERMINATOR_BYTE: u8 = 0xFF;
pub const TERMINATOR_LEN: u8 = 3;

const OP_INT_RETURN: u8 = 0x71;
const INT_RETURN_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn opcode(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Bytes following the opcode.
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Accumulates panel bytes until three consecutive 0xFF bytes close a frame.
#[derive(Debug)]
pub struct Framer {
    buf: [u8; FRAME_CAPACITY],
    len: usize,
    terminators: u8,
    overflowed: bool,
    completed: u64,
    dropped: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: [0; FRAME_CAPACITY],
            len: 0,
            terminators: 0,
            overflowed: false,
            completed: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.terminators == 0
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feeds one byte. Returns the finished frame when this byte was the last
    /// terminator byte. Oversized and empty frames are swallowed.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        // 0x71 carries four raw data bytes that may themselves be 0xFF.
        let in_int_body =
            self.len > 0 && self.buf[0] == OP_INT_RETURN && self.len < INT_RETURN_LEN;

        if byte == TERMINATOR_BYTE && !in_int_body {
            self.terminators += 1;
            if self.terminators < TERMINATOR_LEN {
                return None;
            }
            return self.complete();
        }

        // Stray 0xFF bytes that did not make a full terminator are payload.
        for _ in 0..self.terminators {
            self.append(TERMINATOR_BYTE);
        }
        self.terminators = 0;
        self.append(byte);
        None
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.terminators = 0;
        self.overflowed = false;
    }

    fn append(&mut self, byte: u8) {
        if self.len < FRAME_CAPACITY {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.overflowed = true;
        }
    }

    fn complete(&mut self) -> Option<Frame> {
        let frame = if self.overflowed {
            warn!(
                "HMI frame exceeded {} bytes, discarding (opcode 0x{:02X})",
                FRAME_CAPACITY, self.buf[0]
            );
            self.dropped += 1;
            None
        } else if self.len == 0 {
            None
        } else {
            self.completed += 1;
            Some(Frame::new(self.buf[..self.len].to_vec()))
        };
        self.reset();
        frame
    }
}
