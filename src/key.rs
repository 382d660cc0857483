// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Key Codec: child key creation and the caller owned key blob.

use crate::{
    error::{TpmDeviceError, TpmError},
    session::{password_session, Session},
    util::build_to_vec,
};
use log::{debug, error};
use tpm2_protocol::{
    data::{
        Tpm2bAuth, Tpm2bData, Tpm2bDigest, Tpm2bPrivate, Tpm2bPublic, Tpm2bSensitiveCreate,
        Tpm2bSensitiveData, TpmAlgId, TpmCc, TpmEccCurve, TpmaObject, TpmlPcrSelection,
        TpmsEccParms, TpmsEccPoint, TpmsSensitiveCreate, TpmtKdfScheme, TpmtPublic, TpmtScheme,
        TpmtSymDefObject, TpmuPublicId, TpmuPublicParms, TpmuSymKeyBits, TpmuSymMode,
    },
    message::{TpmCreateCommand, TpmLoadCommand},
    TpmErrorKind, TpmParse,
};

/// Maximum key handle length of a U2F registration.
pub const KEY_BLOB_MAX: usize = 255;

pub const ECC_COORDINATE_SIZE: usize = 32;

/// SEC1 tag of an uncompressed point.
pub const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

/// An uncompressed P-256 public point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccPoint {
    pub x: [u8; ECC_COORDINATE_SIZE],
    pub y: [u8; ECC_COORDINATE_SIZE],
}

impl EccPoint {
    /// Converts a TPM point, left-padding coordinates shorter than 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns `TpmErrorKind::InvalidValue` for coordinates longer than 32
    /// bytes.
    pub fn from_tpm(point: &TpmsEccPoint) -> Result<Self, TpmErrorKind> {
        Ok(Self {
            x: pad_coordinate(&point.x)?,
            y: pad_coordinate(&point.y)?,
        })
    }

    /// Extracts the point from the unique field of an ECC public area.
    ///
    /// # Errors
    ///
    /// Returns `TpmErrorKind::InvalidValue` if the area is not an ECC key.
    pub fn from_public(public: &TpmtPublic) -> Result<Self, TpmErrorKind> {
        match &public.unique {
            TpmuPublicId::Ecc(point) => Self::from_tpm(point),
            _ => Err(TpmErrorKind::InvalidValue),
        }
    }

    /// Returns the SEC1 encoding `0x04 || X || Y`.
    #[must_use]
    pub fn to_uncompressed(&self) -> [u8; 1 + 2 * ECC_COORDINATE_SIZE] {
        let mut out = [0u8; 1 + 2 * ECC_COORDINATE_SIZE];
        out[0] = UNCOMPRESSED_POINT_TAG;
        out[1..=ECC_COORDINATE_SIZE].copy_from_slice(&self.x);
        out[1 + ECC_COORDINATE_SIZE..].copy_from_slice(&self.y);
        out
    }
}

fn pad_coordinate(bytes: &[u8]) -> Result<[u8; ECC_COORDINATE_SIZE], TpmErrorKind> {
    if bytes.len() > ECC_COORDINATE_SIZE {
        return Err(TpmErrorKind::InvalidValue);
    }
    let mut out = [0u8; ECC_COORDINATE_SIZE];
    out[ECC_COORDINATE_SIZE - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

/// The public and private areas of a wrapped key, serialized as
/// `TPM2B_PUBLIC || TPM2B_PRIVATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBlob {
    pub public: Tpm2bPublic,
    pub private: Tpm2bPrivate,
}

impl KeyBlob {
    /// # Errors
    ///
    /// Returns `TpmError::EncodingOverflow` if the blob exceeds
    /// [`KEY_BLOB_MAX`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut bytes = build_to_vec(&self.public)
            .map_err(|e| TpmError::KeyGeneration(TpmDeviceError::Protocol(e)))?;
        bytes.extend(
            build_to_vec(&self.private)
                .map_err(|e| TpmError::KeyGeneration(TpmDeviceError::Protocol(e)))?,
        );
        if bytes.len() > KEY_BLOB_MAX {
            return Err(TpmError::EncodingOverflow {
                len: bytes.len(),
                max: KEY_BLOB_MAX,
            });
        }
        Ok(bytes)
    }

    /// Parses a blob. Truncated input, inconsistent size fields and trailing
    /// bytes are all rejected.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::KeyBlobDecode` on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmError> {
        let (public, rest) = Tpm2bPublic::parse(bytes).map_err(TpmError::KeyBlobDecode)?;
        let (private, rest) = Tpm2bPrivate::parse(rest).map_err(TpmError::KeyBlobDecode)?;
        if !rest.is_empty() {
            return Err(TpmError::KeyBlobDecode(TpmErrorKind::TrailingData));
        }
        if private.is_empty() {
            return Err(TpmError::KeyBlobDecode(TpmErrorKind::InvalidValue));
        }
        Ok(Self { public, private })
    }
}

/// Template of a non-restricted P-256 signing key with no symmetric
/// protection and no KDF.
#[must_use]
pub fn child_template() -> TpmtPublic {
    TpmtPublic {
        object_type: TpmAlgId::Ecc,
        name_alg: TpmAlgId::Sha256,
        object_attributes: TpmaObject::SIGN_ENCRYPT
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::NO_DA
            | TpmaObject::SENSITIVE_DATA_ORIGIN,
        auth_policy: Tpm2bDigest::default(),
        parameters: TpmuPublicParms::Ecc(TpmsEccParms {
            symmetric: TpmtSymDefObject {
                algorithm: TpmAlgId::Null,
                key_bits: TpmuSymKeyBits::Null,
                mode: TpmuSymMode::Null,
            },
            scheme: TpmtScheme {
                scheme: TpmAlgId::Null,
            },
            curve_id: TpmEccCurve::NistP256,
            kdf: TpmtKdfScheme::default(),
        }),
        unique: TpmuPublicId::Ecc(TpmsEccPoint::default()),
    }
}

/// An empty sensitive area: no authorization value and no sealed data.
#[must_use]
pub fn empty_sensitive() -> Tpm2bSensitiveCreate {
    Tpm2bSensitiveCreate {
        inner: TpmsSensitiveCreate {
            user_auth: Tpm2bAuth::default(),
            data: Tpm2bSensitiveData::default(),
        },
    }
}

/// Creates a signing key under `parent` and returns its public point with
/// the serialized key blob.
///
/// # Errors
///
/// Returns `TpmError::KeyGeneration` if the TPM refuses to create the key,
/// and `TpmError::EncodingOverflow` if the blob does not fit the limit.
pub fn generate_keypair(
    session: &mut Session,
    parent: u32,
) -> Result<(EccPoint, Vec<u8>), TpmError> {
    let cmd = TpmCreateCommand {
        parent_handle: parent.into(),
        in_sensitive: empty_sensitive(),
        in_public: Tpm2bPublic {
            inner: child_template(),
        },
        outside_info: Tpm2bData::default(),
        creation_pcr: TpmlPcrSelection::default(),
    };
    let resp = session
        .execute(&cmd, &password_session())
        .and_then(|resp| {
            resp.Create()
                .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::Create))
        })
        .map_err(|e| {
            error!("TPM2_Create under {parent:#010x}: {e}");
            TpmError::KeyGeneration(e)
        })?;

    let point = EccPoint::from_public(&resp.out_public.inner)
        .map_err(|e| TpmError::KeyGeneration(TpmDeviceError::Protocol(e)))?;
    let blob = KeyBlob {
        public: resp.out_public,
        private: resp.out_private,
    }
    .to_bytes()?;
    debug!(
        "created key under {parent:#010x}, blob {} bytes",
        blob.len()
    );
    Ok((point, blob))
}

/// Loads a key blob under `parent` and returns the transient handle.
///
/// # Errors
///
/// Returns `TpmError::KeyBlobDecode` for a malformed blob and
/// `TpmError::KeyLoad` if the TPM rejects it.
pub fn load_key(session: &mut Session, parent: u32, key_blob: &[u8]) -> Result<u32, TpmError> {
    let KeyBlob { public, private } = KeyBlob::from_bytes(key_blob)?;
    let cmd = TpmLoadCommand {
        parent_handle: parent.into(),
        in_private: private,
        in_public: public,
    };
    let result = session.execute(&cmd, &password_session()).and_then(|resp| {
        resp.Load()
            .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::Load))
    });
    match result {
        Ok(resp) => {
            let handle = resp.object_handle.0;
            debug!("loaded {handle:#010x} under {parent:#010x}");
            Ok(handle)
        }
        Err(e) => {
            error!("TPM2_Load under {parent:#010x}: {e}");
            Err(TpmError::KeyLoad(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2_protocol::data::Tpm2bEccParameter;

    fn blob(private_len: usize) -> KeyBlob {
        let mut public = child_template();
        public.unique = TpmuPublicId::Ecc(TpmsEccPoint {
            x: Tpm2bEccParameter::try_from(&[0x11; 32][..]).unwrap(),
            y: Tpm2bEccParameter::try_from(&[0x22; 32][..]).unwrap(),
        });
        KeyBlob {
            public: Tpm2bPublic { inner: public },
            private: Tpm2bPrivate::try_from(vec![0x5A; private_len].as_slice()).unwrap(),
        }
    }

    #[test]
    fn test_blob_round_trip() {
        let key = blob(126);
        let bytes = key.to_bytes().unwrap();
        assert!(bytes.len() <= KEY_BLOB_MAX);
        assert_eq!(KeyBlob::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn test_blob_overflow() {
        let err = blob(200).to_bytes().unwrap_err();
        assert!(matches!(
            err,
            TpmError::EncodingOverflow { len, max: KEY_BLOB_MAX } if len > KEY_BLOB_MAX
        ));
    }

    #[test]
    fn test_blob_rejects_trailing_and_truncated() {
        let mut bytes = blob(126).to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            KeyBlob::from_bytes(&bytes),
            Err(TpmError::KeyBlobDecode(TpmErrorKind::TrailingData))
        ));
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            KeyBlob::from_bytes(&bytes),
            Err(TpmError::KeyBlobDecode(_))
        ));
        assert!(matches!(
            KeyBlob::from_bytes(&[]),
            Err(TpmError::KeyBlobDecode(_))
        ));
    }

    #[test]
    fn test_point_padding() {
        let point = TpmsEccPoint {
            x: Tpm2bEccParameter::try_from(&[0xFF; 31][..]).unwrap(),
            y: Tpm2bEccParameter::try_from(&[0x01; 32][..]).unwrap(),
        };
        let point = EccPoint::from_tpm(&point).unwrap();
        assert!(EccPoint::from_public(&crate::hierarchy::primary_template()).is_ok());
        assert_eq!(point.x[0], 0);
        assert_eq!(point.x[1], 0xFF);
        let sec1 = point.to_uncompressed();
        assert_eq!(sec1[0], UNCOMPRESSED_POINT_TAG);
        assert_eq!(sec1[33..], [0x01; 32]);
    }
}
