// Copyright 2020 Joyent, Inc.

//! Checksum support for Fast message payloads.
//!
//! Two CRC-16 variants exist among deployed Fast peers. The original
//! implementation inherited an unreflected CRC-16 (polynomial 0x1021,
//! initial value 0 -- the XMODEM parameter set) from a buggy checksum
//! library, and servers speaking that variant are still in production.
//! Conformant peers use CRC-16/ARC instead. [`CrcMode`] selects which
//! variant is emitted for outbound messages and which set is accepted
//! when validating inbound ones.

use crc16::{State, ARC, XMODEM};

/// Selects the CRC-16 variant(s) used when encoding and validating Fast
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcMode {
    /// Emit and accept only the legacy checksum.
    Old,
    /// Emit and accept only the conformant CRC-16/ARC checksum.
    New,
    /// Emit the legacy checksum but accept either variant on decode.
    /// This is the recommended mode when interoperating with a mixed
    /// fleet of peers.
    OldNew,
}

impl Default for CrcMode {
    fn default() -> Self {
        CrcMode::OldNew
    }
}

/// Compute the legacy Fast payload checksum.
pub fn crc_old(data: &[u8]) -> u16 {
    State::<XMODEM>::calculate(data)
}

/// Compute the conformant Fast payload checksum.
pub fn crc_new(data: &[u8]) -> u16 {
    State::<ARC>::calculate(data)
}

impl CrcMode {
    /// The checksum emitted for an outbound payload in this mode.
    pub fn emit(self, data: &[u8]) -> u16 {
        match self {
            CrcMode::Old | CrcMode::OldNew => crc_old(data),
            CrcMode::New => crc_new(data),
        }
    }

    /// Whether `crc` is an acceptable checksum for `data` in this mode.
    /// The wire carries the 16-bit checksum in a 32-bit field, so the
    /// comparison is done at 32 bits with the upper bits zero.
    pub fn accepts(self, data: &[u8], crc: u32) -> bool {
        match self {
            CrcMode::Old => u32::from(crc_old(data)) == crc,
            CrcMode::New => u32::from(crc_new(data)) == crc,
            CrcMode::OldNew => {
                u32::from(crc_old(data)) == crc
                    || u32::from(crc_new(data)) == crc
            }
        }
    }
}
