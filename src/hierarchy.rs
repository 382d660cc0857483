// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Key Hierarchy Resolver.

use crate::{
    error::{TpmDeviceError, TpmError},
    key::empty_sensitive,
    session::{password_session, Session},
    tpm::{handle_type, TPM_HT_PERMANENT, TPM_HT_TRANSIENT},
};
use log::{debug, error, warn};
use std::fmt;
use tpm2_protocol::{
    data::{
        Tpm2bData, Tpm2bDigest, Tpm2bPublic, TpmAlgId, TpmCc, TpmEccCurve, TpmRh, TpmaObject,
        TpmlPcrSelection, TpmsEccParms, TpmsEccPoint, TpmtKdfScheme, TpmtPublic, TpmtScheme,
        TpmtSymDefObject, TpmuPublicId, TpmuPublicParms, TpmuSymKeyBits, TpmuSymMode,
    },
    message::TpmCreatePrimaryCommand,
};

/// Hierarchy used for the default sentinel.
pub const DEFAULT_HIERARCHY: u32 = TpmRh::Owner as u32;

/// An opaque parent identifier, tagged by its most significant octet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ParentRef {
    /// The value `0`: derive a primary key under [`DEFAULT_HIERARCHY`].
    #[default]
    Default,
    /// A hierarchy constant (`0x40xxxxxx`): derive a primary key under it.
    Hierarchy(u32),
    /// A transient object (`0x80xxxxxx`): used directly and flushed after use.
    Transient(u32),
    /// Any other handle, e.g. a persistent key, used as is.
    Handle(u32),
}

impl From<u32> for ParentRef {
    fn from(value: u32) -> Self {
        match (value, handle_type(value)) {
            (0, _) => Self::Default,
            (_, TPM_HT_PERMANENT) => Self::Hierarchy(value),
            (_, TPM_HT_TRANSIENT) => Self::Transient(value),
            _ => Self::Handle(value),
        }
    }
}

impl From<ParentRef> for u32 {
    fn from(parent: ParentRef) -> u32 {
        match parent {
            ParentRef::Default => 0,
            ParentRef::Hierarchy(h) | ParentRef::Transient(h) | ParentRef::Handle(h) => h,
        }
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Hierarchy(h) | Self::Transient(h) | Self::Handle(h) => write!(f, "{h:#010x}"),
        }
    }
}

/// The template of the derived primary storage key: ECC P-256, AES-128-CFB
/// symmetric protection, restricted decryption, no authorization value.
///
/// The TPM derives the same key from this template for as long as the
/// hierarchy seed is unchanged.
#[must_use]
pub fn primary_template() -> TpmtPublic {
    TpmtPublic {
        object_type: TpmAlgId::Ecc,
        name_alg: TpmAlgId::Sha256,
        object_attributes: TpmaObject::NO_DA
            | TpmaObject::SENSITIVE_DATA_ORIGIN
            | TpmaObject::FIXED_PARENT
            | TpmaObject::FIXED_TPM
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::DECRYPT
            | TpmaObject::RESTRICTED,
        auth_policy: Tpm2bDigest::default(),
        parameters: TpmuPublicParms::Ecc(TpmsEccParms {
            symmetric: TpmtSymDefObject {
                algorithm: TpmAlgId::Aes,
                key_bits: TpmuSymKeyBits::Aes(128),
                mode: TpmuSymMode::Aes(TpmAlgId::Cfb),
            },
            scheme: TpmtScheme::default(),
            curve_id: TpmEccCurve::NistP256,
            kdf: TpmtKdfScheme::default(),
        }),
        unique: TpmuPublicId::Ecc(TpmsEccPoint::default()),
    }
}

/// Derives the primary storage key under a hierarchy.
///
/// # Errors
///
/// Returns `TpmError::KeyDerivation` if the TPM refuses the derivation.
pub fn create_primary(session: &mut Session, hierarchy: u32) -> Result<u32, TpmError> {
    let cmd = TpmCreatePrimaryCommand {
        primary_handle: hierarchy.into(),
        in_sensitive: empty_sensitive(),
        in_public: Tpm2bPublic {
            inner: primary_template(),
        },
        outside_info: Tpm2bData::default(),
        creation_pcr: TpmlPcrSelection::default(),
    };
    let result = session.execute(&cmd, &password_session()).and_then(|resp| {
        resp.CreatePrimary()
            .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::CreatePrimary))
    });
    match result {
        Ok(resp) => {
            let handle = resp.object_handle.0;
            debug!("primary {handle:#010x} under {hierarchy:#010x}");
            Ok(handle)
        }
        Err(e) => {
            error!("TPM2_CreatePrimary under {hierarchy:#010x}: {e}");
            Err(TpmError::KeyDerivation(hierarchy, e))
        }
    }
}

/// Translates a parent reference into a live object handle.
///
/// # Errors
///
/// Returns `TpmError::KeyDerivation` if a primary key cannot be derived.
pub fn resolve_parent(session: &mut Session, parent: ParentRef) -> Result<u32, TpmError> {
    match parent {
        ParentRef::Default => create_primary(session, DEFAULT_HIERARCHY),
        ParentRef::Hierarchy(hierarchy) => create_primary(session, hierarchy),
        ParentRef::Transient(handle) | ParentRef::Handle(handle) => Ok(handle),
    }
}

/// Disposes of a handle returned by [`resolve_parent`]: transient objects are
/// flushed and the artifact files of the handle are removed. Failures are
/// logged and otherwise ignored.
pub fn release_parent(session: &mut Session, handle: u32) {
    if handle_type(handle) == TPM_HT_TRANSIENT {
        if let Err(e) = session.flush(handle) {
            warn!("flush {handle:#010x}: {e}");
        }
    }
    session.remove_artifacts(handle);
}

/// Runs `f` with a resolved parent and releases the parent afterwards,
/// whatever `f` returns.
///
/// # Errors
///
/// Returns the resolution error, or the error returned by `f`.
pub fn with_parent<T>(
    session: &mut Session,
    parent: ParentRef,
    f: impl FnOnce(&mut Session, u32) -> Result<T, TpmError>,
) -> Result<T, TpmError> {
    let handle = resolve_parent(session, parent)?;
    let result = f(session, handle);
    release_parent(session, handle);
    result
}
