use log::debug;

use crate::frame::Frame;

pub const TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0xFF];

pub const OP_TOUCH: u8 = 0x65;
pub const OP_PAGE: u8 = 0x66;
pub const OP_COORDINATE: u8 = 0x67;
pub const OP_STRING: u8 = 0x70;
pub const OP_INT: u8 = 0x71;
pub const OP_INVALID_VARIABLE: u8 = 0x1A;
pub const OTA_ACK: u8 = 0x05;

pub const CMD_CONNECT: &str = "connect";
pub const CMD_BAUD_RESTORE: &str = "bauds=115200";
pub const CMD_REBOOT: &str = "rest";

pub const PANEL_BAUD: u32 = 115_200;
pub const PANEL_ALT_BAUD: u32 = 9_600;

const HANDSHAKE_PREFIX: &[u8] = b"comok";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    Pressed,
    Released,
}

impl TouchState {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Pressed),
            0x00 => Some(Self::Released),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pressed => "ON",
            Self::Released => "OFF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Touch {
        page: u8,
        button: u8,
        state: TouchState,
    },
    PageChange {
        page: u8,
    },
    Coordinate {
        x: u16,
        y: u16,
        state: TouchState,
    },
    StringReturn(String),
    IntReturn(u32),
    Handshake {
        model: Option<String>,
    },
    InvalidVariable,
}

pub fn decode(frame: &Frame) -> Option<InboundMessage> {
    let bytes = frame.as_bytes();
    if bytes.starts_with(HANDSHAKE_PREFIX) {
        return Some(decode_handshake(bytes));
    }

    let payload = frame.payload();
    let message = match frame.opcode()? {
        OP_TOUCH => match payload {
            [page, button, state, ..] => TouchState::from_byte(*state).map(|state| {
                InboundMessage::Touch {
                    page: *page,
                    button: *button,
                    state,
                }
            }),
            _ => None,
        },
        OP_PAGE => payload
            .first()
            .map(|page| InboundMessage::PageChange { page: *page }),
        OP_COORDINATE => match payload {
            [x_hi, x_lo, y_hi, y_lo, state, ..] => {
                TouchState::from_byte(*state).map(|state| InboundMessage::Coordinate {
                    x: u16::from_be_bytes([*x_hi, *x_lo]),
                    y: u16::from_be_bytes([*y_hi, *y_lo]),
                    state,
                })
            }
            _ => None,
        },
        OP_STRING => Some(InboundMessage::StringReturn(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        OP_INT => match payload {
            [a, b, c, d, ..] => Some(InboundMessage::IntReturn(u32::from_le_bytes([
                *a, *b, *c, *d,
            ]))),
            _ => None,
        },
        OP_INVALID_VARIABLE => Some(InboundMessage::InvalidVariable),
        _ => None,
    };

    if message.is_none() {
        debug!("HMI ignoring frame {:02X?}", bytes);
    }
    message
}

fn decode_handshake(bytes: &[u8]) -> InboundMessage {
    let text = String::from_utf8_lossy(bytes);
    let model = text
        .split(',')
        .nth(2)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string);
    InboundMessage::Handshake { model }
}

pub fn encode_command(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + TERMINATOR.len());
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(&TERMINATOR);
    bytes
}

pub fn upload_command(size: u32, baud: u32) -> String {
    format!("whmi-wri {size},{baud},0")
}

pub fn get_command(attr: &str) -> String {
    format!("get {attr}")
}

pub fn page_command(page: u8) -> String {
    format!("page {page}")
}
