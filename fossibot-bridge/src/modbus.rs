//! Modbus framing for the vendor's register protocol.
//!
//! Requests and responses travel as binary MQTT payloads. Only two request
//! forms exist: read holding registers (function code 3) and write single
//! register (function code 6). The CRC is the usual Modbus CRC-16
//! (polynomial 0xA001, init 0xFFFF) but the vendor appends it high byte
//! first, unlike standard RTU.

use thiserror::Error;

/// Fixed slave address used by every device.
pub const SLAVE_ADDRESS: u8 = 0x11;

/// Function code for "read holding registers".
pub const FUNCTION_READ: u8 = 0x03;

/// Function code for "write single register".
pub const FUNCTION_WRITE: u8 = 0x06;

/// Number of register slots a device exposes (indices 0..=80).
pub const REGISTER_COUNT: usize = 81;

/// Number of registers requested by a full poll.
pub const POLL_REGISTER_COUNT: u16 = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModbusError {
    #[error("frame of {0} bytes is too short to carry a response")]
    TooShort(usize),
    #[error("CRC mismatch: computed {computed:#06x}, frame carries {carried:#06x}")]
    CrcMismatch { computed: u16, carried: u16 },
    #[error("byte count {byte_count} disagrees with frame length {length}")]
    LengthMismatch { byte_count: usize, length: usize },
    #[error("register count {count} disagrees with frame length {length}")]
    CountMismatch { count: usize, length: usize },
    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
    #[error("register range {start}..{end} exceeds the 81-slot register file")]
    RangeOverflow { start: usize, end: usize },
}

/// A contiguous run of register values carried by one response frame.
///
/// `values[i]` belongs to register index `start + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterUpdate {
    pub start: usize,
    pub values: Vec<u16>,
}

impl RegisterUpdate {
    pub fn iter(&self) -> impl Iterator<Item = (usize, u16)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (self.start + i, *v))
    }

    /// Value of a single register, if this update covers it.
    pub fn get(&self, register: usize) -> Option<u16> {
        register
            .checked_sub(self.start)
            .and_then(|i| self.values.get(i))
            .copied()
    }
}

/// CRC-16 with the Modbus polynomial 0xA001, initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            let carry = crc & 1 != 0;
            crc >>= 1;
            if carry {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

fn append_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    // Vendor convention: high byte first.
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xFF) as u8);
    frame
}

/// Builds a read-holding-registers request (function code 3).
pub fn build_read_request(start: u16, count: u16) -> Vec<u8> {
    let frame = vec![
        SLAVE_ADDRESS,
        FUNCTION_READ,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ];
    append_crc(frame)
}

/// Builds a write-single-register request (function code 6).
pub fn build_write_request(register: u16, value: u16) -> Vec<u8> {
    let frame = vec![
        SLAVE_ADDRESS,
        FUNCTION_WRITE,
        (register >> 8) as u8,
        (register & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ];
    append_crc(frame)
}

/// The request published by the periodic poll timer and `refresh` commands.
pub fn build_poll_request() -> Vec<u8> {
    build_read_request(0, POLL_REGISTER_COUNT)
}

fn check_crc(frame: &[u8]) -> Result<(), ModbusError> {
    let body = &frame[..frame.len() - 2];
    let computed = crc16(body);
    let carried = (u16::from(frame[frame.len() - 2]) << 8) | u16::from(frame[frame.len() - 1]);
    if computed != carried {
        return Err(ModbusError::CrcMismatch { computed, carried });
    }
    Ok(())
}

fn read_registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
        .collect()
}

/// Parses a response frame into a register update.
///
/// Devices answer in one of two framings, distinguished by the third byte:
/// a nonzero byte count means standard RTU (`[slave, fc, byteCount,
/// data.., crcHi, crcLo]`); zero means the start-register form
/// (`[slave, fc, startHi, startLo, countHi, countLo, data.., crcHi,
/// crcLo]`). A write echo (function code 6) is reported as a
/// single-register update.
pub fn parse_response(frame: &[u8]) -> Result<RegisterUpdate, ModbusError> {
    if frame.len() < 7 {
        return Err(ModbusError::TooShort(frame.len()));
    }
    check_crc(frame)?;

    let function = frame[1];
    match function {
        FUNCTION_WRITE => {
            // Echo of a write request: register and value, no data section.
            if frame.len() != 8 {
                return Err(ModbusError::LengthMismatch {
                    byte_count: 2,
                    length: frame.len(),
                });
            }
            let register = (u16::from(frame[2]) << 8) | u16::from(frame[3]);
            let value = (u16::from(frame[4]) << 8) | u16::from(frame[5]);
            check_range(register as usize, 1)?;
            Ok(RegisterUpdate {
                start: register as usize,
                values: vec![value],
            })
        }
        FUNCTION_READ => {
            if frame[2] != 0 {
                // Standard RTU: third byte is the byte count.
                let byte_count = frame[2] as usize;
                if frame.len() != 3 + byte_count + 2 || byte_count % 2 != 0 {
                    return Err(ModbusError::LengthMismatch {
                        byte_count,
                        length: frame.len(),
                    });
                }
                check_range(0, byte_count / 2)?;
                Ok(RegisterUpdate {
                    start: 0,
                    values: read_registers(&frame[3..3 + byte_count]),
                })
            } else {
                // Start-register form: the zero is the high byte of the
                // start register (registers never start above 0xFF here).
                if frame.len() < 8 {
                    return Err(ModbusError::TooShort(frame.len()));
                }
                let start = (u16::from(frame[2]) << 8) | u16::from(frame[3]);
                let count = ((u16::from(frame[4]) << 8) | u16::from(frame[5])) as usize;
                if frame.len() != 6 + 2 * count + 2 {
                    return Err(ModbusError::CountMismatch {
                        count,
                        length: frame.len(),
                    });
                }
                check_range(start as usize, count)?;
                Ok(RegisterUpdate {
                    start: start as usize,
                    values: read_registers(&frame[6..6 + 2 * count]),
                })
            }
        }
        other => Err(ModbusError::UnsupportedFunction(other)),
    }
}

fn check_range(start: usize, count: usize) -> Result<(), ModbusError> {
    let end = start + count;
    if end > REGISTER_COUNT {
        return Err(ModbusError::RangeOverflow { start, end });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_form_b(start: u16, values: &[u16]) -> Vec<u8> {
        let mut frame = vec![
            SLAVE_ADDRESS,
            FUNCTION_READ,
            (start >> 8) as u8,
            (start & 0xFF) as u8,
            (values.len() >> 8) as u8,
            (values.len() & 0xFF) as u8,
        ];
        for v in values {
            frame.push((v >> 8) as u8);
            frame.push((v & 0xFF) as u8);
        }
        append_crc(frame)
    }

    fn encode_form_a(values: &[u16]) -> Vec<u8> {
        let mut frame = vec![SLAVE_ADDRESS, FUNCTION_READ, (values.len() * 2) as u8];
        for v in values {
            frame.push((v >> 8) as u8);
            frame.push((v & 0xFF) as u8);
        }
        append_crc(frame)
    }

    #[test]
    fn usb_enable_request_bytes() {
        let frame = build_write_request(24, 1);
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x18, 0x00, 0x01]);
        let crc = crc16(&frame[..6]);
        assert_eq!(frame[6], (crc >> 8) as u8);
        assert_eq!(frame[7], (crc & 0xFF) as u8);
    }

    #[test]
    fn write_round_trip() {
        let frame = build_write_request(68, 30);
        let update = parse_response(&frame).unwrap();
        assert_eq!(update.start, 68);
        assert_eq!(update.values, vec![30]);
    }

    #[test]
    fn poll_request_covers_the_register_file() {
        let frame = build_poll_request();
        assert_eq!(&frame[..6], &[0x11, 0x03, 0x00, 0x00, 0x00, 0x50]);
    }

    #[test]
    fn parses_standard_rtu_framing() {
        let frame = encode_form_a(&[7, 640, 0xFFFF]);
        let update = parse_response(&frame).unwrap();
        assert_eq!(update.start, 0);
        assert_eq!(update.values, vec![7, 640, 0xFFFF]);
    }

    #[test]
    fn parses_start_register_framing() {
        let frame = encode_form_b(41, &[640, 0, 1]);
        let update = parse_response(&frame).unwrap();
        assert_eq!(update.start, 41);
        assert_eq!(update.get(41), Some(640));
        assert_eq!(update.get(43), Some(1));
        assert_eq!(update.get(40), None);
        assert_eq!(update.get(44), None);
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut frame = encode_form_a(&[1, 2, 3]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_response(&frame),
            Err(ModbusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn rejects_byte_count_disagreeing_with_length() {
        let mut frame = vec![SLAVE_ADDRESS, FUNCTION_READ, 6, 0, 1, 0, 2];
        frame = append_crc(frame);
        assert!(matches!(
            parse_response(&frame),
            Err(ModbusError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_register_count_disagreeing_with_length() {
        let mut frame = vec![SLAVE_ADDRESS, FUNCTION_READ, 0, 0, 0, 3, 0, 1, 0, 2];
        frame = append_crc(frame);
        assert!(matches!(
            parse_response(&frame),
            Err(ModbusError::CountMismatch { .. })
        ));
    }

    #[test]
    fn rejects_out_of_file_register_range() {
        let frame = encode_form_b(80, &[1, 2]);
        assert!(matches!(
            parse_response(&frame),
            Err(ModbusError::RangeOverflow { .. })
        ));
    }

    #[test]
    fn rejects_unknown_function_code() {
        let mut frame = vec![SLAVE_ADDRESS, 0x10, 0x00, 0x00, 0x00, 0x01, 0x02];
        frame = append_crc(frame);
        assert!(matches!(
            parse_response(&frame),
            Err(ModbusError::UnsupportedFunction(0x10))
        ));
    }

    #[test]
    fn crc_matches_known_vector() {
        // Standard CRC-16/MODBUS check value.
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }
}
