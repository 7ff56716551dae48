use crate::error::SpmError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

// Control port framing
pub const COMMAND_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 40;
pub const RESPONSE_FLAG: u16 = 1;
pub const ZERO_BUFFER: u16 = 0;

// Event port framing
pub const EVENT_HEADER_SIZE: usize = 6;
pub const FRAME_EVENT: u16 = 1;
pub const FRAME_SAMPLES: u16 = 2;
pub const FRAME_RESTART: u16 = 3;
pub const FRAME_ACK: u16 = 0x10;

// A sample buffer holds at most one full two-pass line of every signal
pub const MAX_FRAME_SIGNALS: usize = 64;
pub const MAX_FRAME_POINTS: usize = 2 * 32_768;
/// Largest payload accepted on either port, bytes
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIGNALS * MAX_FRAME_POINTS * 4;

/// Value carried in a command body or response
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    String(String),
    ArrayF32(Vec<f32>),
    ArrayString(Vec<String>),
}

impl WireValue {
    pub fn as_bool(&self) -> Result<bool, SpmError> {
        match self {
            WireValue::Bool(v) => Ok(*v),
            WireValue::U32(v) => Ok(*v != 0),
            WireValue::I32(v) => Ok(*v != 0),
            _ => Err(SpmError::Type(format!("Expected bool, got {self:?}"))),
        }
    }

    pub fn as_i32(&self) -> Result<i32, SpmError> {
        match self {
            WireValue::I32(v) => Ok(*v),
            _ => Err(SpmError::Type(format!("Expected i32, got {self:?}"))),
        }
    }

    pub fn as_f32(&self) -> Result<f32, SpmError> {
        match self {
            WireValue::F32(v) => Ok(*v),
            _ => Err(SpmError::Type(format!("Expected f32, got {self:?}"))),
        }
    }

    pub fn as_f32_array(&self) -> Result<&[f32], SpmError> {
        match self {
            WireValue::ArrayF32(v) => Ok(v),
            _ => Err(SpmError::Type(format!("Expected f32 array, got {self:?}"))),
        }
    }

    pub fn as_string_array(&self) -> Result<&[String], SpmError> {
        match self {
            WireValue::ArrayString(v) => Ok(v),
            _ => Err(SpmError::Type(format!("Expected string array, got {self:?}"))),
        }
    }
}

/// Error section trailing every response body
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorSection {
    pub status: i32,
    pub message: String,
}

/// Notification frame read from the event port
#[derive(Debug, Clone, PartialEq)]
pub enum EventFrame {
    Event(i32),
    Samples(Vec<f32>),
    Restart,
}

/// Low-level protocol handling
pub struct Protocol;

impl Protocol {
    /// Serialize a value according to its type tag.
    ///
    /// Tags: `B` bool as u32, `H` u16, `i` i32, `I` u32, `f` f32,
    /// `+*c` length-prefixed string, `+*f` length-prefixed f32 array,
    /// `+*s` string array with total size and count prefix.
    pub fn serialize_value(
        value: &WireValue,
        body_type: &str,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SpmError> {
        match (value, body_type) {
            (WireValue::Bool(v), "B") => buffer.write_u32::<BigEndian>(u32::from(*v))?,
            (WireValue::U16(v), "H") => buffer.write_u16::<BigEndian>(*v)?,
            (WireValue::I32(v), "i") => buffer.write_i32::<BigEndian>(*v)?,
            (WireValue::U32(v), "I") => buffer.write_u32::<BigEndian>(*v)?,
            (WireValue::F32(v), "f") => buffer.write_f32::<BigEndian>(*v)?,

            (WireValue::String(s), "+*c") => {
                buffer.write_u32::<BigEndian>(s.len() as u32)?;
                buffer.extend_from_slice(s.as_bytes());
            }

            (WireValue::ArrayF32(arr), "+*f") => {
                buffer.write_u32::<BigEndian>(arr.len() as u32)?;
                for &val in arr {
                    buffer.write_f32::<BigEndian>(val)?;
                }
            }

            (WireValue::ArrayString(strings), "+*s") => {
                let total: usize = strings.iter().map(|s| 4 + s.len()).sum();
                buffer.write_u32::<BigEndian>(total as u32)?;
                buffer.write_u32::<BigEndian>(strings.len() as u32)?;
                for s in strings {
                    buffer.write_u32::<BigEndian>(s.len() as u32)?;
                    buffer.extend_from_slice(s.as_bytes());
                }
            }

            _ => {
                return Err(SpmError::Type(format!(
                    "Unsupported type combination: {value:?} with {body_type}"
                )))
            }
        }
        Ok(())
    }

    /// Parse response values followed by the error section
    pub fn parse_response(
        response: &[u8],
        response_types: &[&str],
    ) -> Result<(Vec<WireValue>, ErrorSection), SpmError> {
        let mut cursor = Cursor::new(response);
        let mut result = Vec::with_capacity(response_types.len());

        for &response_type in response_types {
            let value = match response_type {
                "B" => WireValue::Bool(cursor.read_u32::<BigEndian>()? != 0),
                "H" => WireValue::U16(cursor.read_u16::<BigEndian>()?),
                "i" => WireValue::I32(cursor.read_i32::<BigEndian>()?),
                "I" => WireValue::U32(cursor.read_u32::<BigEndian>()?),
                "f" => WireValue::F32(cursor.read_f32::<BigEndian>()?),

                "+*c" => WireValue::String(Self::read_string(&mut cursor)?),

                "+*f" => {
                    let len = cursor.read_u32::<BigEndian>()? as usize;
                    let mut arr = Vec::with_capacity(len);
                    for _ in 0..len {
                        arr.push(cursor.read_f32::<BigEndian>()?);
                    }
                    WireValue::ArrayF32(arr)
                }

                "+*s" => {
                    // Total byte size is redundant with the per-string lengths
                    let _total_size = cursor.read_u32::<BigEndian>()?;
                    let count = cursor.read_u32::<BigEndian>()? as usize;
                    let mut strings = Vec::with_capacity(count);
                    for _ in 0..count {
                        strings.push(Self::read_string(&mut cursor)?);
                    }
                    WireValue::ArrayString(strings)
                }

                _ => {
                    return Err(SpmError::Type(format!(
                        "Unsupported response type: {response_type}"
                    )))
                }
            };

            result.push(value);
        }

        let error = Self::parse_error_section(&mut cursor)?;
        Ok((result, error))
    }

    fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, SpmError> {
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    fn parse_error_section(cursor: &mut Cursor<&[u8]>) -> Result<ErrorSection, SpmError> {
        let status = cursor.read_i32::<BigEndian>()?;
        let size = cursor.read_i32::<BigEndian>()?;
        if size < 0 {
            return Err(SpmError::Protocol(format!(
                "Negative error message size {size}"
            )));
        }
        let mut bytes = vec![0u8; size as usize];
        cursor.read_exact(&mut bytes)?;
        Ok(ErrorSection {
            status,
            message: String::from_utf8_lossy(&bytes).to_string(),
        })
    }

    /// Create command header with proper padding
    pub fn create_command_header(command: &str, body_size: u32) -> Vec<u8> {
        let mut message = Vec::with_capacity(HEADER_SIZE);

        let mut command_bytes = [0u8; COMMAND_SIZE];
        let cmd_bytes = command.as_bytes();
        let len = cmd_bytes.len().min(COMMAND_SIZE);
        command_bytes[..len].copy_from_slice(&cmd_bytes[..len]);
        message.extend_from_slice(&command_bytes);

        message.extend_from_slice(&body_size.to_be_bytes());
        message.extend_from_slice(&RESPONSE_FLAG.to_be_bytes());
        message.extend_from_slice(&ZERO_BUFFER.to_be_bytes());

        message
    }

    /// Validate response header and return the body size
    pub fn validate_response_header(
        header: &[u8; HEADER_SIZE],
        expected_command: &str,
    ) -> Result<u32, SpmError> {
        let body_size = u32::from_be_bytes([header[32], header[33], header[34], header[35]]);

        let received_command = String::from_utf8_lossy(&header[0..COMMAND_SIZE])
            .trim_end_matches('\0')
            .to_string();

        if received_command == expected_command {
            Ok(body_size)
        } else {
            Err(SpmError::CommandMismatch {
                expected: expected_command.to_string(),
                actual: received_command,
            })
        }
    }

    /// Reject payload sizes no well-formed frame can have
    pub fn checked_payload_len(len: u32) -> Result<usize, SpmError> {
        let len = len as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(SpmError::Protocol(format!(
                "Frame payload of {len} bytes exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }
        Ok(len)
    }

    /// Read one notification frame: u16 kind, u32 payload length, payload
    pub fn read_event_frame<R: Read>(reader: &mut R) -> Result<EventFrame, SpmError> {
        let kind = reader.read_u16::<BigEndian>()?;
        let len = Self::checked_payload_len(reader.read_u32::<BigEndian>()?)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut cursor = Cursor::new(payload.as_slice());

        match kind {
            FRAME_EVENT => Ok(EventFrame::Event(cursor.read_i32::<BigEndian>()?)),
            FRAME_SAMPLES => {
                if len % 4 != 0 {
                    return Err(SpmError::Protocol(format!(
                        "Sample frame of {len} bytes is not a whole number of values"
                    )));
                }
                let mut values = Vec::with_capacity(len / 4);
                for _ in 0..len / 4 {
                    values.push(cursor.read_f32::<BigEndian>()?);
                }
                Ok(EventFrame::Samples(values))
            }
            FRAME_RESTART => Ok(EventFrame::Restart),
            other => Err(SpmError::Protocol(format!("Unknown event frame kind {other}"))),
        }
    }

    /// Acknowledgement written after a sample frame was consumed
    pub fn ack_frame(consumed: bool) -> [u8; EVENT_HEADER_SIZE] {
        let mut frame = [0u8; EVENT_HEADER_SIZE];
        frame[..2].copy_from_slice(&FRAME_ACK.to_be_bytes());
        frame[2..].copy_from_slice(&u32::from(consumed).to_be_bytes());
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_section(status: i32, message: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&status.to_be_bytes());
        bytes.extend_from_slice(&(message.len() as i32).to_be_bytes());
        bytes.extend_from_slice(message.as_bytes());
        bytes
    }

    #[test]
    fn test_header_layout() {
        let header = Protocol::create_command_header("Scan.ExecPoint", 12);
        assert_eq!(header.len(), HEADER_SIZE);
        assert_eq!(&header[..14], b"Scan.ExecPoint");
        assert!(header[14..COMMAND_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&header[32..36], &12u32.to_be_bytes());
        assert_eq!(&header[36..38], &RESPONSE_FLAG.to_be_bytes());
    }

    #[test]
    fn test_response_header_mismatch() {
        let mut header = [0u8; HEADER_SIZE];
        header[..10].copy_from_slice(b"Probe.Lift");
        header[35] = 8;
        assert_eq!(
            Protocol::validate_response_header(&header, "Probe.Lift").unwrap(),
            8
        );
        assert!(matches!(
            Protocol::validate_response_header(&header, "Probe.Land"),
            Err(SpmError::CommandMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_response_with_error_section() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&0.5f32.to_be_bytes());
        body.extend_from_slice(&1.5f32.to_be_bytes());
        body.extend(error_section(0, ""));

        let (values, error) = Protocol::parse_response(&body, &["B", "+*f"]).unwrap();
        assert_eq!(values[0], WireValue::Bool(true));
        assert_eq!(values[1].as_f32_array().unwrap(), &[0.5, 1.5]);
        assert_eq!(error.status, 0);

        let body = error_section(3, "axis out of range");
        let (_, error) = Protocol::parse_response(&body, &[]).unwrap();
        assert_eq!(error.status, 3);
        assert_eq!(error.message, "axis out of range");
    }

    #[test]
    fn test_string_array_body() {
        let mut buffer = Vec::new();
        let signals = WireValue::ArrayString(vec!["Height".into(), "Mag".into()]);
        Protocol::serialize_value(&signals, "+*s", &mut buffer).unwrap();
        buffer.extend(error_section(0, ""));
        let (values, _) = Protocol::parse_response(&buffer, &["+*s"]).unwrap();
        assert_eq!(values[0], signals);

        assert!(Protocol::serialize_value(&WireValue::F32(1.0), "i", &mut buffer).is_err());
    }

    #[test]
    fn test_event_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_SAMPLES.to_be_bytes());
        wire.extend_from_slice(&8u32.to_be_bytes());
        wire.extend_from_slice(&1.0f32.to_be_bytes());
        wire.extend_from_slice(&2.0f32.to_be_bytes());
        wire.extend_from_slice(&FRAME_SAMPLES.to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());
        wire.extend_from_slice(&FRAME_EVENT.to_be_bytes());
        wire.extend_from_slice(&4u32.to_be_bytes());
        wire.extend_from_slice(&2i32.to_be_bytes());
        wire.extend_from_slice(&FRAME_RESTART.to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());

        let mut reader = Cursor::new(wire);
        assert_eq!(
            Protocol::read_event_frame(&mut reader).unwrap(),
            EventFrame::Samples(vec![1.0, 2.0])
        );
        assert_eq!(
            Protocol::read_event_frame(&mut reader).unwrap(),
            EventFrame::Samples(vec![])
        );
        assert_eq!(
            Protocol::read_event_frame(&mut reader).unwrap(),
            EventFrame::Event(2)
        );
        assert_eq!(
            Protocol::read_event_frame(&mut reader).unwrap(),
            EventFrame::Restart
        );
        assert!(Protocol::read_event_frame(&mut reader).is_err());
    }

    #[test]
    fn test_oversized_event_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_SAMPLES.to_be_bytes());
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        wire.extend_from_slice(&1.0f32.to_be_bytes());

        let err = Protocol::read_event_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, SpmError::Protocol(_)));

        assert_eq!(
            Protocol::checked_payload_len(MAX_PAYLOAD_SIZE as u32).unwrap(),
            MAX_PAYLOAD_SIZE
        );
        assert!(Protocol::checked_payload_len(MAX_PAYLOAD_SIZE as u32 + 1).is_err());
    }
}
