//! CRC parameterizations used across the wire formats.
//!
//! Three distinct checksums are in play, and two of them are easy to
//! conflate because the reference firmware calls both "CRC-8": the
//! inner-packet header uses polynomial `0x07`, while inter-MCU frames use
//! polynomial `0x31`. Both are MSB-first with no input/output reflection and
//! a zero initial register. All three are expressed through the `crc`
//! crate's generic `Algorithm` catalog rather than hand-rolled bit loops.

use crc::{Algorithm, Crc};

const CRC_8_HEADER: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x00,
    residue: 0x00,
};

const CRC_8_INTER_MCU: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x00,
    residue: 0x00,
};

const CRC_16_MODBUS: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0x4B37,
    residue: 0x0000,
};

/// CRC-8 over the first four bytes of an inner-packet header (poly `0x07`).
pub fn crc8_header(data: &[u8]) -> u8 {
    Crc::<u8>::new(&CRC_8_HEADER).checksum(data)
}

/// CRC-8 over an inter-MCU frame's command+length+payload (poly `0x31`).
pub fn crc8_inter_mcu(data: &[u8]) -> u8 {
    Crc::<u8>::new(&CRC_8_INTER_MCU).checksum(data)
}

/// CRC-16/MODBUS, used for both inner-packet bodies and outer frames.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    Crc::<u16>::new(&CRC_16_MODBUS).checksum(data)
}

/// Standard CRC-32 (poly `0x04C11DB7` reflected, init/xorout `0xFFFFFFFF`),
/// used for the OTA image checksum.
pub fn crc32_ota(data: &[u8]) -> u32 {
    Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_of_empty_is_zero() {
        assert_eq!(crc8_header(&[]), 0);
        assert_eq!(crc8_inter_mcu(&[]), 0);
    }

    #[test]
    fn crc8_header_and_inter_mcu_diverge() {
        // Same polynomial family, different poly byte: must not collide on
        // a representative nonzero input.
        let input = [0xAA, 0x20, 0x00, 0x01];
        assert_ne!(crc8_header(&input), crc8_inter_mcu(&input));
    }

    #[test]
    fn crc16_modbus_matches_known_vector() {
        assert_eq!(crc16_modbus(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
    }

    #[test]
    fn crc32_ota_matches_known_vector() {
        assert_eq!(crc32_ota(b"123456789"), 0xCBF4_3926);
    }
}
