//! CRC16-CCITT used by both protocol generations.
//!
//! Polynomial 0x1021, seed 0xFFFF, no reflection and no final xor
//! (catalogued as CRC-16/IBM-3740). The footer is appended big-endian.

use crc::{CRC_16_IBM_3740, Crc};

const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Compute the CRC over `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16_CCITT.checksum(data)
}

/// Append the big-endian CRC of `frame[start..]` to `frame`.
pub fn append_crc(frame: &mut Vec<u8>, start: usize) {
    let crc = crc16_ccitt(&frame[start..]);
    frame.extend_from_slice(&crc.to_be_bytes());
}

/// Read the big-endian CRC footer of `frame`.
pub fn footer(frame: &[u8]) -> Option<u16> {
    let n = frame.len();
    if n < 2 {
        return None;
    }
    Some(u16::from_be_bytes([frame[n - 2], frame[n - 1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_append_and_recompute() {
        let mut frame = vec![0x04, 0x06, 0x00, 0x08, 0x01, 0xAA, 0x55];
        append_crc(&mut frame, 1);
        let body = &frame[1..frame.len() - 2];
        assert_eq!(footer(&frame), Some(crc16_ccitt(body)));
    }

    #[test]
    fn test_single_byte_mutation_changes_crc() {
        let data: Vec<u8> = (0u8..64).collect();
        let reference = crc16_ccitt(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut mutated = data.clone();
                mutated[i] ^= 1 << bit;
                assert_ne!(crc16_ccitt(&mutated), reference, "byte {i} bit {bit}");
            }
        }
    }
}
