// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Cipher modes and control operation codes.
//!
//! The mode codes are the 3-bit values the accelerator expects in the low
//! bits of a command's task word. The control codes match the Linux ioctl
//! numbers of the original character device (`'C'` magic).

use crate::error::{AesError, AesResult};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// Cipher modes supported by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherMode {
    /// Electronic codebook, encrypt.
    EcbEncrypt = 0,
    /// Electronic codebook, decrypt.
    EcbDecrypt = 1,
    /// Cipher block chaining, encrypt.
    CbcEncrypt = 2,
    /// Cipher block chaining, decrypt.
    CbcDecrypt = 3,
    /// 128-bit cipher feedback, encrypt.
    CfbEncrypt = 4,
    /// 128-bit cipher feedback, decrypt.
    CfbDecrypt = 5,
    /// Output feedback (same operation both ways).
    Ofb = 6,
    /// Counter mode (same operation both ways).
    Ctr = 7,
}

impl CipherMode {
    /// All modes in hardware code order.
    pub const ALL: [CipherMode; 8] = [
        Self::EcbEncrypt,
        Self::EcbDecrypt,
        Self::CbcEncrypt,
        Self::CbcDecrypt,
        Self::CfbEncrypt,
        Self::CfbDecrypt,
        Self::Ofb,
        Self::Ctr,
    ];

    /// Returns the 3-bit hardware mode code.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a hardware mode code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::EcbEncrypt),
            1 => Some(Self::EcbDecrypt),
            2 => Some(Self::CbcEncrypt),
            3 => Some(Self::CbcDecrypt),
            4 => Some(Self::CfbEncrypt),
            5 => Some(Self::CfbDecrypt),
            6 => Some(Self::Ofb),
            7 => Some(Self::Ctr),
            _ => None,
        }
    }

    /// Returns true if the mode carries a chaining value between blocks.
    #[inline]
    pub const fn has_state(self) -> bool {
        !matches!(self, Self::EcbEncrypt | Self::EcbDecrypt)
    }

    /// Returns a human-readable name for the mode.
    pub const fn name(self) -> &'static str {
        match self {
            Self::EcbEncrypt => "ECB_ENCRYPT",
            Self::EcbDecrypt => "ECB_DECRYPT",
            Self::CbcEncrypt => "CBC_ENCRYPT",
            Self::CbcDecrypt => "CBC_DECRYPT",
            Self::CfbEncrypt => "CFB_ENCRYPT",
            Self::CfbDecrypt => "CFB_DECRYPT",
            Self::Ofb => "OFB",
            Self::Ctr => "CTR",
        }
    }

    /// The mode that undoes this one.
    pub const fn inverse(self) -> Self {
        match self {
            Self::EcbEncrypt => Self::EcbDecrypt,
            Self::EcbDecrypt => Self::EcbEncrypt,
            Self::CbcEncrypt => Self::CbcDecrypt,
            Self::CbcDecrypt => Self::CbcEncrypt,
            Self::CfbEncrypt => Self::CfbDecrypt,
            Self::CfbDecrypt => Self::CfbEncrypt,
            Self::Ofb => Self::Ofb,
            Self::Ctr => Self::Ctr,
        }
    }
}

impl std::fmt::Display for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.code())
    }
}

// Linux _IOC encoding.
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOCTL_MAGIC: u32 = b'C' as u32;
const GET_STATE_NR: u32 = 0x08;

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | (IOCTL_MAGIC << 8) | nr
}

/// Control operations accepted by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Select a mode; the argument is the key, followed by the IV for
    /// every mode except ECB.
    SetMode(CipherMode),
    /// Read back the current 16-byte chaining value.
    GetState,
}

impl ControlOp {
    /// Number of argument bytes the operation transfers.
    pub const fn arg_len(self) -> usize {
        match self {
            Self::SetMode(mode) if mode.has_state() => KEY_SIZE + BLOCK_SIZE,
            Self::SetMode(_) => KEY_SIZE,
            Self::GetState => BLOCK_SIZE,
        }
    }

    /// Linux ioctl number for the operation.
    pub const fn ioctl_number(self) -> u32 {
        match self {
            Self::SetMode(mode) => ioc(IOC_WRITE, mode.code() as u32, self.arg_len() as u32),
            Self::GetState => ioc(IOC_READ, GET_STATE_NR, BLOCK_SIZE as u32),
        }
    }

    /// Decode a Linux ioctl number.
    pub fn from_ioctl(cmd: u32) -> AesResult<Self> {
        let op = if (cmd >> 8) & 0xFF != IOCTL_MAGIC {
            None
        } else if cmd & 0xFF == GET_STATE_NR {
            Some(Self::GetState)
        } else {
            CipherMode::from_code((cmd & 0xFF) as u8).map(Self::SetMode)
        };

        match op {
            Some(op) if op.ioctl_number() == cmd => Ok(op),
            _ => Err(AesError::UnknownControl(cmd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_codes() {
        for (i, mode) in CipherMode::ALL.iter().enumerate() {
            assert_eq!(mode.code() as usize, i);
            assert_eq!(CipherMode::from_code(i as u8), Some(*mode));
        }
        assert_eq!(CipherMode::from_code(8), None);
    }

    #[test]
    fn test_has_state() {
        assert!(!CipherMode::EcbEncrypt.has_state());
        assert!(!CipherMode::EcbDecrypt.has_state());
        assert!(CipherMode::CbcDecrypt.has_state());
        assert!(CipherMode::Ofb.has_state());
        assert!(CipherMode::Ctr.has_state());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(format!("{}", CipherMode::CbcEncrypt), "CBC_ENCRYPT (0x02)");
        assert_eq!(format!("{}", CipherMode::Ctr), "CTR (0x07)");
    }

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(
            ControlOp::SetMode(CipherMode::EcbEncrypt).ioctl_number(),
            0x4010_4300
        );
        assert_eq!(
            ControlOp::SetMode(CipherMode::CbcEncrypt).ioctl_number(),
            0x4020_4302
        );
        assert_eq!(ControlOp::SetMode(CipherMode::Ctr).ioctl_number(), 0x4020_4307);
        assert_eq!(ControlOp::GetState.ioctl_number(), 0x8010_4308);
    }

    #[test]
    fn test_from_ioctl() {
        for mode in CipherMode::ALL {
            let op = ControlOp::SetMode(mode);
            assert_eq!(ControlOp::from_ioctl(op.ioctl_number()).unwrap(), op);
        }
        assert_eq!(
            ControlOp::from_ioctl(0x8010_4308).unwrap(),
            ControlOp::GetState
        );
        // ECB opcode with an IV-sized argument is not a valid command.
        assert!(matches!(
            ControlOp::from_ioctl(0x4020_4300),
            Err(AesError::UnknownControl(0x4020_4300))
        ));
        assert!(ControlOp::from_ioctl(0x4010_4400).is_err());
        assert!(ControlOp::from_ioctl(0x4010_4309).is_err());
    }
}
