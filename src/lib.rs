// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! TPM 2.0 backed key generation, use counter and signing core for U2F
//! authenticators.
//!
//! Keys never leave the TPM in clear form. A generated key is returned to the
//! caller as a wrapped blob that only loads under the parent it was created
//! under, and every signature is bound to a monotonic counter kept in TPM
//! non-volatile memory.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod authenticator;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod device;
pub mod error;
pub mod hierarchy;
pub mod key;
pub mod mocktpm;
pub mod session;
pub mod tpm;
pub mod transport;
pub mod util;

pub use authenticator::{
    Assertion, AuthenticateResponse, Authenticator, GeneratedKey, RegisterResponse,
    U2fAuthenticateRequest,
};
pub use config::{Config, TpmTarget};
pub use error::{TpmDeviceError, TpmError, TpmRcExt};
pub use hierarchy::ParentRef;
pub use key::EccPoint;
