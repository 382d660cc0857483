// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::tpm::TpmNt;
use std::{fmt, io::Error as IoError};
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmCc, TpmRc, TpmRcBase},
    TpmErrorKind,
};

const RC_FMT1: u32 = 0x080;
const RC_FMT1_P: u32 = 0x040;
const RC_FMT1_S: u32 = 0x800;

/// Human readable rendering of a response code: the base message, the
/// sub-message naming the faulting handle, parameter or session, and the raw
/// numeric code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcDescription {
    pub message: String,
    pub submessage: String,
    pub code: String,
}

impl fmt::Display for RcDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.submessage.is_empty() {
            write!(f, " ({})", self.submessage)?;
        }
        write!(f, " [{}]", self.code)
    }
}

/// Decoding of the format-one fields of a `TpmRc`.
pub trait TpmRcExt {
    /// Format-one codes carry the faulting handle, parameter or session.
    fn is_format_one(&self) -> bool;

    /// Strips the handle, parameter and session number bits.
    fn base_value(&self) -> u32;

    /// Returns `true` for `TPM_RC_HANDLE` regardless of which handle,
    /// parameter or session slot it was reported for.
    fn is_handle_not_found(&self) -> bool;

    fn describe(&self) -> RcDescription;
}

impl TpmRcExt for TpmRc {
    fn is_format_one(&self) -> bool {
        self.value() & RC_FMT1 != 0
    }

    fn base_value(&self) -> u32 {
        if self.is_format_one() {
            RC_FMT1 | (self.value() & 0x3F)
        } else {
            self.value() & 0xFFF
        }
    }

    fn is_handle_not_found(&self) -> bool {
        self.is_format_one() && self.base_value() == TpmRcBase::Handle as u32
    }

    fn describe(&self) -> RcDescription {
        let value = self.value();
        let submessage = if self.is_format_one() {
            let number = (value >> 8) & 0xF;
            if value & RC_FMT1_P != 0 {
                format!("parameter {number}")
            } else if number == 0 {
                String::new()
            } else if value & RC_FMT1_S != 0 {
                format!("session {}", number & 0x7)
            } else {
                format!("handle {}", number & 0x7)
            }
        } else {
            String::new()
        };
        RcDescription {
            message: self.to_string(),
            submessage,
            code: format!("{value:#05x}"),
        }
    }
}

/// Failures of a single command round trip through `TpmDevice`.
#[derive(Debug, Error)]
pub enum TpmDeviceError {
    #[error("handle not found: {}", .0.describe())]
    HandleNotFound(TpmRc),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("TPM protocol: {0}")]
    Protocol(TpmErrorKind),

    #[error("{}", .0.describe())]
    Rc(TpmRc),

    #[error("response mismatch: {0:?}")]
    ResponseMismatch(TpmCc),

    #[error("response overflow")]
    ResponseOverflow,

    #[error("response underflow")]
    ResponseUnderflow,

    #[error("TPM unexpected: {0}")]
    UnexpectedResponse(String),
}

impl From<TpmErrorKind> for TpmDeviceError {
    fn from(err: TpmErrorKind) -> Self {
        Self::Protocol(err)
    }
}

/// Decodes a response code at the device boundary: `TPM_RC_HANDLE` in any
/// slot becomes `HandleNotFound`, everything else `Rc`.
impl From<TpmRc> for TpmDeviceError {
    fn from(rc: TpmRc) -> Self {
        if rc.is_handle_not_found() {
            Self::HandleNotFound(rc)
        } else {
            Self::Rc(rc)
        }
    }
}

impl TpmDeviceError {
    /// Returns the response code, if the TPM reported one.
    #[must_use]
    pub fn rc(&self) -> Option<TpmRc> {
        match self {
            Self::HandleNotFound(rc) | Self::Rc(rc) => Some(*rc),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_handle_not_found(&self) -> bool {
        matches!(self, Self::HandleNotFound(_))
    }
}

/// Errors reported by the authenticator operations.
#[derive(Debug, Error)]
pub enum TpmError {
    #[error("backend init: {0}")]
    BackendInit(#[source] TpmDeviceError),

    #[error("config: {0}")]
    Config(String),

    #[error("counter {0:#010x}: {1}")]
    Counter(u32, #[source] TpmDeviceError),

    #[error("counter {0:#010x} provisioning: {1}")]
    CounterProvision(u32, #[source] TpmDeviceError),

    #[error("key blob of {len} bytes exceeds the maximum of {max}")]
    EncodingOverflow { len: usize, max: usize },

    #[error("NV index {index:#010x} is of type '{found}', not a counter")]
    InvalidCounterType { index: u32, found: TpmNt },

    #[error("key blob: {0}")]
    KeyBlobDecode(TpmErrorKind),

    #[error("primary key derivation under {0:#010x}: {1}")]
    KeyDerivation(u32, #[source] TpmDeviceError),

    #[error("key generation: {0}")]
    KeyGeneration(#[source] TpmDeviceError),

    #[error("key load: {0}")]
    KeyLoad(#[source] TpmDeviceError),

    #[error("signing: {0}")]
    Signing(#[source] TpmDeviceError),
}

impl TpmError {
    /// Returns the response code of the underlying TPM failure, if any.
    #[must_use]
    pub fn rc(&self) -> Option<TpmRc> {
        match self {
            Self::BackendInit(e)
            | Self::Counter(_, e)
            | Self::CounterProvision(_, e)
            | Self::KeyDerivation(_, e)
            | Self::KeyGeneration(e)
            | Self::KeyLoad(e)
            | Self::Signing(e) => e.rc(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rc(value: u32) -> TpmRc {
        TpmRc::try_from(value).unwrap()
    }

    #[rstest]
    #[case(0x08B, true)]
    #[case(0x18B, true)]
    #[case(0x28B, true)]
    #[case(0x1CB, true)]
    #[case(0x98B, true)]
    #[case(0x084, false)]
    #[case(0x14A, false)]
    #[case(0x902, false)]
    #[case(0x1C4, false)]
    fn test_handle_not_found_classification(#[case] value: u32, #[case] expected: bool) {
        assert_eq!(rc(value).is_handle_not_found(), expected);
        let err = TpmDeviceError::from(rc(value));
        assert_eq!(err.is_handle_not_found(), expected);
        assert_eq!(err.rc().map(|rc| rc.value()), Some(value));
    }

    #[test]
    fn test_describe_handle_slot() {
        let desc = rc(0x18B).describe();
        assert!(!desc.message.is_empty());
        assert_eq!(desc.submessage, "handle 1");
        assert_eq!(desc.code, "0x18b");
    }

    #[test]
    fn test_describe_parameter_slot() {
        let desc = rc(0x1C4).describe();
        assert_eq!(rc(0x1C4).base_value(), TpmRcBase::Value as u32);
        assert_eq!(desc.submessage, "parameter 1");
    }

    #[test]
    fn test_describe_format_zero() {
        let nv_defined = rc(0x14C);
        assert!(!nv_defined.is_format_one());
        let desc = nv_defined.describe();
        assert!(desc.submessage.is_empty());
        assert!(desc.to_string().ends_with("[0x14c]"));
        assert!(TpmDeviceError::from(nv_defined)
            .to_string()
            .ends_with("[0x14c]"));
        assert!(rc(0x902).is_warning());
    }
}
