// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Signing Engine and the exported authenticator operations.
//!
//! Every operation opens its own [`Session`], and every handle it acquires is
//! released before it returns.

use crate::{
    config::Config,
    counter::get_or_create_counter,
    crypto::{der_signature, u2f_digest, U2F_COUNTER_SIZE, U2F_USER_PRESENT},
    error::{TpmDeviceError, TpmError},
    hierarchy::{with_parent, ParentRef},
    key::{generate_keypair, load_key, EccPoint, KEY_BLOB_MAX},
    session::{password_session, Session},
    transport::Connector,
};
use log::{debug, error, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tpm2_protocol::{
    data::{
        Tpm2bDigest, TpmAlgId, TpmCc, TpmRh, TpmSt, TpmsSchemeHash, TpmtSigScheme, TpmtTkHashcheck,
        TpmuSigScheme, TpmuSignature,
    },
    message::TpmSignCommand,
};

pub const U2F_APPID_SIZE: usize = 32;
pub const U2F_CHAL_SIZE: usize = 32;

/// A freshly generated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub public: EccPoint,
    pub key_blob: Vec<u8>,
}

/// Result of a successful signing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// Low 32 bits of the use counter, big-endian.
    pub counter: [u8; U2F_COUNTER_SIZE],
    /// DER encoded ECDSA signature.
    pub signature: Vec<u8>,
}

/// The fixed fields of a U2F authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U2fAuthenticateRequest {
    pub challenge: [u8; U2F_CHAL_SIZE],
    pub application: [u8; U2F_APPID_SIZE],
    pub key_handle_len: u8,
    pub key_handle: [u8; KEY_BLOB_MAX],
}

impl U2fAuthenticateRequest {
    /// # Errors
    ///
    /// Returns `TpmError::EncodingOverflow` if the key handle is longer than
    /// [`KEY_BLOB_MAX`].
    pub fn new(
        challenge: [u8; U2F_CHAL_SIZE],
        application: [u8; U2F_APPID_SIZE],
        key_handle: &[u8],
    ) -> Result<Self, TpmError> {
        let key_handle_len =
            u8::try_from(key_handle.len()).map_err(|_| TpmError::EncodingOverflow {
                len: key_handle.len(),
                max: KEY_BLOB_MAX,
            })?;
        let mut buf = [0u8; KEY_BLOB_MAX];
        buf[..key_handle.len()].copy_from_slice(key_handle);
        Ok(Self {
            challenge,
            application,
            key_handle_len,
            key_handle: buf,
        })
    }

    /// The key handle as declared by its length field.
    #[must_use]
    pub fn key_handle(&self) -> &[u8] {
        &self.key_handle[..usize::from(self.key_handle_len)]
    }
}

/// Response to an authentication request. `signature` is empty on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub user_presence: u8,
    pub counter: [u8; U2F_COUNTER_SIZE],
    pub signature: Vec<u8>,
}

/// Response to a registration request. `key_handle` is empty on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub public_key: Option<EccPoint>,
    pub key_handle: Vec<u8>,
}

/// A TPM-backed U2F authenticator.
///
/// Operations are serialized: each one holds an internal lock for the
/// lifetime of its session.
#[derive(Debug)]
pub struct Authenticator {
    config: Config,
    connector: Box<dyn Connector>,
    lock: Mutex<()>,
}

impl Authenticator {
    #[must_use]
    pub fn new(config: Config, connector: Box<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            lock: Mutex::new(()),
        }
    }

    /// Creates an authenticator that connects to the configured target.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        let connector = Box::new(config.target.clone());
        Self::new(config, connector)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn open(&self) -> Result<(MutexGuard<'_, ()>, Session), TpmError> {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let session = Session::open(self.connector.as_ref(), &self.config.runtime_dir)?;
        Ok((guard, session))
    }

    fn parent(&self, parent: ParentRef) -> ParentRef {
        match parent {
            ParentRef::Default => self.config.parent,
            parent => parent,
        }
    }

    /// Creates a new signing key under `parent`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::BackendInit`, `TpmError::KeyDerivation`,
    /// `TpmError::KeyGeneration` or `TpmError::EncodingOverflow`.
    pub fn generate_key(&self, parent: ParentRef) -> Result<GeneratedKey, TpmError> {
        let (_guard, mut session) = self.open()?;
        let (public, key_blob) = with_parent(&mut session, self.parent(parent), generate_keypair)?;
        Ok(GeneratedKey { public, key_blob })
    }

    /// Loads the key blob under `parent` and flushes it again.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::KeyBlobDecode` or `TpmError::KeyLoad` if the blob
    /// does not load, or any session or parent resolution error.
    pub fn check_key(&self, parent: ParentRef, key_blob: &[u8]) -> Result<(), TpmError> {
        let (_guard, mut session) = self.open()?;
        let handle = with_parent(&mut session, self.parent(parent), |session, parent| {
            load_key(session, parent, key_blob)
        })?;
        release_key(&mut session, handle);
        Ok(())
    }

    /// Returns `true` if the key blob loads under `parent`.
    #[must_use]
    pub fn verify_loadable(&self, parent: ParentRef, key_blob: &[u8]) -> bool {
        match self.check_key(parent, key_blob) {
            Ok(()) => true,
            Err(e) => {
                debug!("key does not load: {e}");
                false
            }
        }
    }

    /// Signs a U2F authentication digest with the key blob, incrementing the
    /// counter at `counter_index` or the configured default.
    ///
    /// The counter is only touched once the key has loaded.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::KeyLoad` or `TpmError::KeyBlobDecode` if the key
    /// does not load, a counter error, or `TpmError::Signing`.
    pub fn sign(
        &self,
        parent: ParentRef,
        counter_index: Option<u32>,
        application: &[u8; U2F_APPID_SIZE],
        challenge: &[u8; U2F_CHAL_SIZE],
        key_blob: &[u8],
    ) -> Result<Assertion, TpmError> {
        let (r, s, counter) = {
            let (_guard, mut session) = self.open()?;
            let key = with_parent(&mut session, self.parent(parent), |session, parent| {
                load_key(session, parent, key_blob)
            })?;
            let index = counter_index.or(Some(self.config.counter_index));
            let result = sign_loaded(&mut session, key, index, application, challenge);
            release_key(&mut session, key);
            session.close();
            result?
        };

        let signature = der_signature(&r, &s).map_err(|e| {
            error!("signature encoding: {e}");
            TpmError::Signing(TpmDeviceError::Protocol(e))
        })?;
        Ok(Assertion { counter, signature })
    }

    /// Registration entry point: generates a key under the configured parent.
    #[must_use]
    pub fn register(&self) -> RegisterResponse {
        match self.generate_key(ParentRef::Default) {
            Ok(key) => RegisterResponse {
                public_key: Some(key.public),
                key_handle: key.key_blob,
            },
            Err(e) => {
                error!("register: {e}");
                RegisterResponse {
                    public_key: None,
                    key_handle: Vec::new(),
                }
            }
        }
    }

    /// Authentication entry point. The signature is empty on any failure.
    #[must_use]
    pub fn authenticate(&self, request: &U2fAuthenticateRequest) -> AuthenticateResponse {
        match self.sign(
            ParentRef::Default,
            None,
            &request.application,
            &request.challenge,
            request.key_handle(),
        ) {
            Ok(assertion) => AuthenticateResponse {
                user_presence: U2F_USER_PRESENT,
                counter: assertion.counter,
                signature: assertion.signature,
            },
            Err(e) => {
                error!("authenticate: {e}");
                AuthenticateResponse {
                    user_presence: U2F_USER_PRESENT,
                    counter: [0; U2F_COUNTER_SIZE],
                    signature: Vec::new(),
                }
            }
        }
    }
}

type RawSignature = (Vec<u8>, Vec<u8>, [u8; U2F_COUNTER_SIZE]);

fn sign_loaded(
    session: &mut Session,
    key: u32,
    counter_index: Option<u32>,
    application: &[u8; U2F_APPID_SIZE],
    challenge: &[u8; U2F_CHAL_SIZE],
) -> Result<RawSignature, TpmError> {
    let counter = get_or_create_counter(session, counter_index)?.to_be_bytes();
    let digest = u2f_digest(application, counter, challenge);

    let cmd = TpmSignCommand {
        key_handle: key.into(),
        digest: Tpm2bDigest::try_from(&digest[..])
            .map_err(|e| TpmError::Signing(TpmDeviceError::Protocol(e)))?,
        in_scheme: TpmtSigScheme {
            scheme: TpmAlgId::Ecdsa,
            details: TpmuSigScheme::Any(TpmsSchemeHash {
                hash_alg: TpmAlgId::Sha256,
            }),
        },
        validation: TpmtTkHashcheck {
            tag: TpmSt::HashCheck,
            hierarchy: TpmRh::Null,
            digest: Tpm2bDigest::default(),
        },
    };
    let resp = session
        .execute(&cmd, &password_session())
        .and_then(|resp| {
            resp.Sign()
                .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::Sign))
        })
        .map_err(|e| {
            error!("TPM2_Sign {key:#010x}: {e}");
            TpmError::Signing(e)
        })?;
    let TpmuSignature::Ecdsa(signature) = resp.signature.signature else {
        error!("TPM2_Sign {key:#010x}: not an ECDSA signature");
        return Err(TpmError::Signing(TpmDeviceError::ResponseMismatch(
            TpmCc::Sign,
        )));
    };
    Ok((
        signature.signature_r.to_vec(),
        signature.signature_s.to_vec(),
        counter,
    ))
}

fn release_key(session: &mut Session, handle: u32) {
    if let Err(e) = session.flush(handle) {
        warn!("flush {handle:#010x}: {e}");
    }
    session.remove_artifacts(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_authenticator_is_send_sync() {
        assert_send_sync::<Authenticator>();
    }

    #[test]
    fn test_request_key_handle() {
        let request = U2fAuthenticateRequest::new([1; 32], [2; 32], &[3; 70]).unwrap();
        assert_eq!(request.key_handle(), &[3; 70]);
        assert!(matches!(
            U2fAuthenticateRequest::new([1; 32], [2; 32], &[3; 256]),
            Err(TpmError::EncodingOverflow { len: 256, .. })
        ));
    }
}
