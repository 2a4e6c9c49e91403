/// Binary command protocol.
///
/// ```text
/// byte 0   opcode
/// byte 1.. opcode-specific payload (only the first byte is interpreted)
/// ```
///
/// | opcode | payload                                   | reply                      |
/// |--------|-------------------------------------------|----------------------------|
/// | 0x01   | bit0 camera, bit1 flashlight, bit2 auto   | echo                       |
/// | 0x02   | 0x00 / absent = off, else on              | echo                       |
/// | 0x03   | 0x00 / absent = off, else on              | echo                       |
/// | 0x04   | none                                      | `[0x04, legacy, status]`   |
/// | other  | -                                         | `[0x00]`                   |

use serde::Serialize;

use crate::error::DeviceError;

/// Reply for anything not understood.
pub const NOOP_ACK: u8 = 0x00;

/// Second byte of every status reply. Older controllers expect this fixed
/// bitmask; it does not reflect live state.
pub const LEGACY_STATUS_BYTE: u8 = 0b111;

/// Status byte bit: a stream session is live.
pub const STATUS_STREAMING: u8 = 0b01;
/// Status byte bit: the alarm is sounding.
pub const STATUS_ALARM: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    MotionDetection = 0x01,
    RtmpVideo = 0x02,
    WarningSound = 0x03,
    InspectStatus = 0x04,
}

impl TryFrom<u8> for Opcode {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::MotionDetection),
            0x02 => Ok(Opcode::RtmpVideo),
            0x03 => Ok(Opcode::WarningSound),
            0x04 => Ok(Opcode::InspectStatus),
            other => Err(DeviceError::MalformedCommand(format!("unknown opcode 0x{other:02x}"))),
        }
    }
}

/// Motion-detection configuration bitset carried by `MOTION_DETECTION`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MotionFlags(u8);

impl MotionFlags {
    pub const CAMERA: u8 = 0b001;
    pub const FLASH_LIGHT: u8 = 0b010;
    pub const AUTO_WARNING: u8 = 0b100;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn new(camera: bool, flash_light: bool, auto_warning: bool) -> Self {
        let mut bits = 0;
        if camera {
            bits |= Self::CAMERA;
        }
        if flash_light {
            bits |= Self::FLASH_LIGHT;
        }
        if auto_warning {
            bits |= Self::AUTO_WARNING;
        }
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn camera(self) -> bool {
        self.0 & Self::CAMERA != 0
    }

    pub fn flash_light(self) -> bool {
        self.0 & Self::FLASH_LIGHT != 0
    }

    pub fn auto_warning(self) -> bool {
        self.0 & Self::AUTO_WARNING != 0
    }
}

/// A decoded request. Borrowed from the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub opcode: Opcode,
    pub payload: &'a [u8],
}

impl<'a> Command<'a> {
    pub fn decode(message: &'a [u8]) -> Result<Self, DeviceError> {
        let (&first, payload) = message
            .split_first()
            .ok_or_else(|| DeviceError::MalformedCommand("empty message".into()))?;
        Ok(Self {
            opcode: Opcode::try_from(first)?,
            payload,
        })
    }

    /// First payload byte, `0` when absent.
    pub fn arg(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }

    pub fn switch_on(&self) -> bool {
        self.arg() != 0
    }
}

/// Build the wire bytes for `opcode` with an optional argument.
pub fn encode(opcode: Opcode, arg: Option<u8>) -> Vec<u8> {
    let mut out = vec![opcode as u8];
    out.extend(arg);
    out
}

/// Live device state as reported by `INSPECT_STATUS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub streaming: bool,
    pub alarm: bool,
}

impl DeviceStatus {
    pub fn status_byte(self) -> u8 {
        let mut bits = 0;
        if self.streaming {
            bits |= STATUS_STREAMING;
        }
        if self.alarm {
            bits |= STATUS_ALARM;
        }
        bits
    }

    pub fn to_reply(self) -> Vec<u8> {
        vec![Opcode::InspectStatus as u8, LEGACY_STATUS_BYTE, self.status_byte()]
    }

    /// Parse an `INSPECT_STATUS` reply.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        match reply {
            [op, _legacy, status, ..] if *op == Opcode::InspectStatus as u8 => Some(Self {
                streaming: status & STATUS_STREAMING != 0,
                alarm: status & STATUS_ALARM != 0,
            }),
            _ => None,
        }
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse hex like `"0105"` or `"01 05"`.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, DeviceError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(DeviceError::MalformedCommand(format!("invalid hex: {text}")));
    }
    if digits.len() % 2 != 0 {
        return Err(DeviceError::MalformedCommand(format!("odd-length hex: {text}")));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| DeviceError::MalformedCommand(format!("invalid hex: {text}")))
        })
        .collect()
}
