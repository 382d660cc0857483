// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Handle classification and NV counter attribute helpers.

use std::fmt;
use tpm2_protocol::data::TpmaNv;

pub const TPM_HEADER_SIZE: usize = 10;

pub const TPM_HT_NV_INDEX: u8 = 0x01;
pub const TPM_HT_PERMANENT: u8 = 0x40;
pub const TPM_HT_TRANSIENT: u8 = 0x80;

/// Returns the handle type, i.e. the most significant octet of a handle.
#[must_use]
pub const fn handle_type(handle: u32) -> u8 {
    (handle >> 24) as u8
}

pub const TPMA_NV_OWNERWRITE: u32 = 1 << 1;
pub const TPMA_NV_AUTHWRITE: u32 = 1 << 2;
pub const TPMA_NV_OWNERREAD: u32 = 1 << 17;
pub const TPMA_NV_AUTHREAD: u32 = 1 << 18;
pub const TPMA_NV_NO_DA: u32 = 1 << 25;
pub const TPMA_NV_WRITTEN: u32 = 1 << 29;

const TPM_NT_SHIFT: u32 = 4;
const TPM_NT_MASK: u32 = 0xF << TPM_NT_SHIFT;

/// `TPM_NT`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmNt {
    Ordinary = 0x0,
    Counter = 0x1,
    Bits = 0x2,
    Extend = 0x4,
    PinFail = 0x8,
    PinPass = 0x9,
    Unknown = 0xF,
}

impl TpmNt {
    const fn from_bits(value: u32) -> Self {
        match value {
            0x0 => Self::Ordinary,
            0x1 => Self::Counter,
            0x2 => Self::Bits,
            0x4 => Self::Extend,
            0x8 => Self::PinFail,
            0x9 => Self::PinPass,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TpmNt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ordinary => "ordinary",
            Self::Counter => "counter",
            Self::Bits => "bits",
            Self::Extend => "extend",
            Self::PinFail => "pin-fail",
            Self::PinPass => "pin-pass",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Returns the index type encoded in bits 4..7 of the attributes.
#[must_use]
pub fn nv_index_type(attributes: TpmaNv) -> TpmNt {
    TpmNt::from_bits((attributes.bits() & TPM_NT_MASK) >> TPM_NT_SHIFT)
}

/// Builds NV attributes from raw `TPMA_NV` bits and an index type.
#[must_use]
pub fn nv_attributes(bits: u32, nt: TpmNt) -> TpmaNv {
    TpmaNv::from_bits_truncate((bits & !TPM_NT_MASK) | ((nt as u32) << TPM_NT_SHIFT))
}
