// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! A reference TPM implementing the commands used by the authenticator.
//!
//! Primary keys are derived deterministically from a per-hierarchy seed and
//! the template. Child private areas are wrapped under the parent's seed with
//! AES-128-CFB and an HMAC-SHA256 integrity digest over the encrypted
//! sensitive area and the object name.

use crate::{
    crypto::{
        crypto_hmac, crypto_hmac_verify, crypto_kdfa, crypto_make_name, crypto_make_nv_name,
        KDF_LABEL_INTEGRITY, KDF_LABEL_STORAGE,
    },
    error::TpmDeviceError,
    tpm::{
        nv_attributes, nv_index_type, TpmNt, TPMA_NV_AUTHREAD, TPMA_NV_AUTHWRITE, TPMA_NV_NO_DA,
        TPMA_NV_OWNERREAD, TPMA_NV_OWNERWRITE, TPMA_NV_WRITTEN, TPM_HEADER_SIZE,
    },
    transport::{Connector, PipeTransport, Transport},
    util::build_to_vec,
};
use aes::Aes128;
use cfb_mode::{
    cipher::{AsyncStreamCipher, KeyIvInit},
    Decryptor, Encryptor,
};
use log::{debug, error};
use p256::{
    ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tpm2_protocol::{
    data::{
        Tpm2bCreationData, Tpm2bDigest, Tpm2bEccParameter, Tpm2bMaxNvBuffer, Tpm2bName,
        Tpm2bNvPublic, Tpm2bPrivate, Tpm2bPublic, TpmAlgId, TpmEccCurve, TpmRc, TpmRcBase, TpmRh,
        TpmaNv, TpmaObject, TpmsAuthCommand, TpmsEccPoint, TpmsNvPublic, TpmsSignatureEcc,
        TpmtPublic, TpmtSensitive, TpmtSignature, TpmtTkCreation, TpmuPublicId, TpmuPublicParms,
        TpmuSensitiveComposite, TpmuSigScheme, TpmuSignature, TPM_RH_TRANSIENT_FIRST,
    },
    message::{
        tpm_build_response, tpm_parse_command, TpmAuthResponses, TpmCommandBody, TpmCreateCommand,
        TpmCreatePrimaryCommand, TpmCreatePrimaryResponse, TpmCreateResponse,
        TpmFlushContextCommand, TpmFlushContextResponse, TpmLoadCommand, TpmLoadResponse,
        TpmNvDefineSpaceCommand, TpmNvDefineSpaceResponse, TpmNvIncrementCommand,
        TpmNvIncrementResponse, TpmNvReadCommand, TpmNvReadPublicCommand, TpmNvReadPublicResponse,
        TpmNvReadResponse, TpmResponseBody, TpmSignCommand, TpmSignResponse,
    },
    TpmBuffer, TpmErrorKind, TpmParse, TpmTransient, TpmWriter, TPM_MAX_COMMAND_SIZE,
};

/// Number of transient object slots.
pub const MOCKTPM_TRANSIENT_SLOTS: usize = 3;

const KDF_LABEL_PRIMARY: &str = "PRIMARY";
const KDF_LABEL_SEED: &str = "SEED";

const RC_P: u32 = 0x040;
const RC_1: u32 = 0x100;
const RC_2: u32 = 0x200;

type MockTpmResult = Result<(TpmRc, TpmResponseBody, TpmAuthResponses), TpmRc>;

/// Converts `TpmErrorKind` to `TpmRc`.
trait TpmErrorKindExt {
    fn to_tpm_rc(self) -> TpmRc;
}

impl TpmErrorKindExt for TpmErrorKind {
    fn to_tpm_rc(self) -> TpmRc {
        let base = match self {
            TpmErrorKind::AuthMissing => TpmRcBase::AuthMissing,
            TpmErrorKind::InvalidMagic { .. } | TpmErrorKind::InvalidTag { .. } => {
                TpmRcBase::BadTag
            }
            TpmErrorKind::BuildCapacity
            | TpmErrorKind::ParseCapacity
            | TpmErrorKind::InvalidValue
            | TpmErrorKind::NotDiscriminant(..) => TpmRcBase::Value,
            TpmErrorKind::BuildOverflow
            | TpmErrorKind::ParseUnderflow
            | TpmErrorKind::TrailingData => TpmRcBase::Size,
            TpmErrorKind::Unreachable => TpmRcBase::Failure,
        };
        TpmRc::from(base)
    }
}

/// A format-one response code tagged with the faulting handle or parameter.
fn mocktpm_rc(base: TpmRcBase, slot: u32) -> TpmRc {
    TpmRc::try_from(base as u32 + slot).unwrap_or_else(|_| TpmRc::from(base))
}

fn mocktpm_ok(body: TpmResponseBody) -> MockTpmResult {
    Ok((
        TpmRc::from(TpmRcBase::Success),
        body,
        TpmAuthResponses::default(),
    ))
}

trait MockTpmResponse {
    fn build(
        &self,
        writer: &mut TpmWriter,
        rc: TpmRc,
        auth_responses: &TpmAuthResponses,
    ) -> Result<(), TpmRc>;
}

macro_rules! mocktpm_response {
    ($($variant:ident),* $(,)?) => {
        impl MockTpmResponse for TpmResponseBody {
            fn build(
                &self,
                writer: &mut TpmWriter,
                rc: TpmRc,
                auth_responses: &TpmAuthResponses,
            ) -> Result<(), TpmRc> {
                match self {
                    $(
                        TpmResponseBody::$variant(r) => {
                            tpm_build_response(r, auth_responses, rc, writer)
                                .map_err(TpmErrorKindExt::to_tpm_rc)
                        }
                    )*
                    _ => Err(TpmErrorKind::Unreachable.to_tpm_rc()),
                }
            }
        }
    };
}

mocktpm_response!(
    Create,
    CreatePrimary,
    FlushContext,
    Load,
    NvDefineSpace,
    NvIncrement,
    NvRead,
    NvReadPublic,
    Sign,
);

macro_rules! mocktpm_command {
    ($state:ident, $cmd_body:ident, $sessions:ident, $($variant:ident => $handler:path),* $(,)?) => {
        match $cmd_body {
            $(
                TpmCommandBody::$variant(cmd) => $handler($state, &cmd, &$sessions),
            )*
            _ => Err(TpmRc::from(TpmRcBase::CommandCode)),
        }
    };
}

#[derive(Debug, Clone)]
struct MockTpmObject {
    public: TpmtPublic,
    secret: SecretKey,
    /// Wrapping seed of a storage key.
    seed: Vec<u8>,
}

impl MockTpmObject {
    fn name(&self) -> Result<Vec<u8>, TpmRc> {
        crypto_make_name(&self.public).map_err(TpmErrorKindExt::to_tpm_rc)
    }

    fn is_storage_parent(&self) -> bool {
        let attrs = self.public.object_attributes;
        attrs.contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT) && !self.seed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct MockTpmNvIndex {
    public: TpmsNvPublic,
    data: Vec<u8>,
}

impl MockTpmNvIndex {
    fn is_written(&self) -> bool {
        self.public.attributes.bits() & TPMA_NV_WRITTEN != 0
    }
}

#[derive(Debug)]
struct MockTpmState {
    seeds: HashMap<u32, [u8; 32]>,
    objects: BTreeMap<u32, MockTpmObject>,
    nv_indices: BTreeMap<u32, MockTpmNvIndex>,
    next_transient_handle: u32,
    last_signature: Option<(Vec<u8>, Vec<u8>)>,
}

impl MockTpmState {
    fn new() -> Self {
        let seeds = [
            TpmRh::Owner,
            TpmRh::Endorsement,
            TpmRh::Platform,
            TpmRh::Null,
        ]
        .into_iter()
        .map(|hierarchy| {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            (hierarchy as u32, seed)
        })
        .collect();
        Self {
            seeds,
            objects: BTreeMap::new(),
            nv_indices: BTreeMap::new(),
            next_transient_handle: TPM_RH_TRANSIENT_FIRST,
            last_signature: None,
        }
    }

    fn insert_object(&mut self, object: MockTpmObject) -> Result<u32, TpmRc> {
        if self.objects.len() >= MOCKTPM_TRANSIENT_SLOTS {
            return Err(TpmRc::from(TpmRcBase::ObjectMemory));
        }
        let handle = self.next_transient_handle;
        self.next_transient_handle += 1;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn parse(&mut self, request_buf: &[u8]) -> MockTpmResult {
        let (_handles, cmd_body, sessions) =
            tpm_parse_command(request_buf).map_err(TpmErrorKindExt::to_tpm_rc)?;

        mocktpm_command! {
            self, cmd_body, sessions,
            Create => mocktpm_create,
            CreatePrimary => mocktpm_create_primary,
            FlushContext => mocktpm_flush_context,
            Load => mocktpm_load,
            NvDefineSpace => mocktpm_nv_define_space,
            NvIncrement => mocktpm_nv_increment,
            NvRead => mocktpm_nv_read,
            NvReadPublic => mocktpm_nv_read_public,
            Sign => mocktpm_sign,
        }
    }
}

/// A shared reference TPM. Clones refer to the same TPM state.
#[derive(Debug, Clone)]
pub struct MockTpm {
    state: Arc<Mutex<MockTpmState>>,
}

impl Default for MockTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTpm {
    /// Creates a TPM with fresh random hierarchy seeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockTpmState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockTpmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves commands from a stream until it is closed.
    pub fn serve(&self, stream: impl Read + Write) {
        mocktpm_run(stream, &self.state);
    }

    /// Loaded transient object handles.
    #[must_use]
    pub fn transient_handles(&self) -> Vec<u32> {
        self.state().objects.keys().copied().collect()
    }

    /// Defined NV indices.
    #[must_use]
    pub fn nv_indices(&self) -> Vec<u32> {
        self.state().nv_indices.keys().copied().collect()
    }

    /// Name of a loaded object.
    #[must_use]
    pub fn object_name(&self, handle: u32) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&handle)
            .and_then(|object| object.name().ok())
    }

    /// The raw `(r, s)` of the most recent signature.
    #[must_use]
    pub fn last_signature(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.state().last_signature.clone()
    }

    /// Defines a written counter index holding `value`.
    pub fn set_counter(&self, index: u32, value: u64) {
        let attributes = nv_attributes(
            TPMA_NV_OWNERWRITE
                | TPMA_NV_OWNERREAD
                | TPMA_NV_AUTHWRITE
                | TPMA_NV_AUTHREAD
                | TPMA_NV_NO_DA
                | TPMA_NV_WRITTEN,
            TpmNt::Counter,
        );
        self.define(index, attributes, value.to_be_bytes().to_vec());
    }

    /// Defines a written ordinary index of `size` zero bytes.
    pub fn define_ordinary(&self, index: u32, size: u16) {
        let attributes = nv_attributes(
            TPMA_NV_OWNERWRITE | TPMA_NV_OWNERREAD | TPMA_NV_WRITTEN,
            TpmNt::Ordinary,
        );
        self.define(index, attributes, vec![0; usize::from(size)]);
    }

    fn define(&self, index: u32, attributes: TpmaNv, data: Vec<u8>) {
        let public = TpmsNvPublic {
            nv_index: index.into(),
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::default(),
            data_size: u16::try_from(data.len()).unwrap_or(u16::MAX),
        };
        self.state()
            .nv_indices
            .insert(index, MockTpmNvIndex { public, data });
    }
}

impl Connector for MockTpm {
    fn connect(&self) -> Result<Box<dyn Transport>, TpmDeviceError> {
        let (server, client) = PipeTransport::pair();
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("mocktpm".to_string())
            .spawn(move || mocktpm_run(server, &state))?;
        Ok(Box::new(client))
    }
}

fn check_ecc_template(public: &TpmtPublic) -> Result<(), TpmRc> {
    if public.name_alg != TpmAlgId::Sha256 {
        return Err(mocktpm_rc(TpmRcBase::Hash, RC_P + RC_2));
    }
    match &public.parameters {
        TpmuPublicParms::Ecc(params) if params.curve_id == TpmEccCurve::NistP256 => Ok(()),
        TpmuPublicParms::Ecc(_) => Err(mocktpm_rc(TpmRcBase::Curve, RC_P + RC_2)),
        _ => Err(mocktpm_rc(TpmRcBase::Type, RC_P + RC_2)),
    }
}

fn ecc_point(secret: &SecretKey) -> Result<TpmsEccPoint, TpmRc> {
    let point = secret.public_key().to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        return Err(TpmRc::from(TpmRcBase::NoResult));
    };
    Ok(TpmsEccPoint {
        x: Tpm2bEccParameter::try_from(x.as_slice()).map_err(TpmErrorKindExt::to_tpm_rc)?,
        y: Tpm2bEccParameter::try_from(y.as_slice()).map_err(TpmErrorKindExt::to_tpm_rc)?,
    })
}

fn to_name(name: &[u8]) -> Result<Tpm2bName, TpmRc> {
    Tpm2bName::try_from(name).map_err(TpmErrorKindExt::to_tpm_rc)
}

fn mocktpm_create_primary(
    tpm: &mut MockTpmState,
    cmd: &TpmCreatePrimaryCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let hierarchy = cmd.primary_handle.0;
    let Some(seed) = tpm.seeds.get(&hierarchy).copied() else {
        return Err(mocktpm_rc(TpmRcBase::Hierarchy, RC_1));
    };
    let mut public = cmd.in_public.inner.clone();
    check_ecc_template(&public)?;

    let template = build_to_vec(&public).map_err(TpmErrorKindExt::to_tpm_rc)?;
    let template_hash = Sha256::digest(&template);
    let scalar = crypto_kdfa(&seed, KDF_LABEL_PRIMARY, &template_hash, &[], 256)
        .map_err(TpmErrorKindExt::to_tpm_rc)?;
    let secret = SecretKey::from_slice(&scalar).map_err(|_| TpmRc::from(TpmRcBase::NoResult))?;
    let object_seed = crypto_kdfa(&seed, KDF_LABEL_SEED, &template_hash, &[], 256)
        .map_err(TpmErrorKindExt::to_tpm_rc)?;

    public.unique = TpmuPublicId::Ecc(ecc_point(&secret)?);
    let object = MockTpmObject {
        public: public.clone(),
        secret,
        seed: object_seed,
    };
    let name = to_name(&object.name()?)?;
    let handle = tpm.insert_object(object)?;

    mocktpm_ok(TpmResponseBody::CreatePrimary(TpmCreatePrimaryResponse {
        object_handle: TpmTransient(handle),
        out_public: Tpm2bPublic { inner: public },
        creation_data: Tpm2bCreationData::default(),
        creation_hash: TpmBuffer::default(),
        creation_ticket: TpmtTkCreation::default(),
        name,
    }))
}

/// Derives the symmetric and integrity keys protecting a child of `parent`.
fn wrap_keys(parent: &MockTpmObject, name: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRc> {
    let sym_key = crypto_kdfa(&parent.seed, KDF_LABEL_STORAGE, name, &[], 128)
        .map_err(TpmErrorKindExt::to_tpm_rc)?;
    let hmac_key = crypto_kdfa(&parent.seed, KDF_LABEL_INTEGRITY, &[], &[], 256)
        .map_err(TpmErrorKindExt::to_tpm_rc)?;
    Ok((sym_key, hmac_key))
}

fn storage_parent(tpm: &MockTpmState, handle: u32) -> Result<&MockTpmObject, TpmRc> {
    let Some(parent) = tpm.objects.get(&handle) else {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_1));
    };
    if !parent.is_storage_parent() {
        return Err(mocktpm_rc(TpmRcBase::Type, RC_1));
    }
    Ok(parent)
}

fn mocktpm_create(
    tpm: &mut MockTpmState,
    cmd: &TpmCreateCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let parent = storage_parent(tpm, cmd.parent_handle.0)?;
    let mut public = cmd.in_public.inner.clone();
    check_ecc_template(&public)?;
    if !public.object_attributes.contains(TpmaObject::SIGN_ENCRYPT) {
        return Err(mocktpm_rc(TpmRcBase::Attributes, RC_P + RC_2));
    }

    let secret = SecretKey::random(&mut OsRng);
    public.unique = TpmuPublicId::Ecc(ecc_point(&secret)?);
    let name = crypto_make_name(&public).map_err(TpmErrorKindExt::to_tpm_rc)?;

    let sensitive = TpmtSensitive::from_private_bytes(TpmAlgId::Ecc, secret.to_bytes().as_slice())
        .map_err(TpmErrorKindExt::to_tpm_rc)?;
    let mut enc_sensitive = build_to_vec(&sensitive).map_err(TpmErrorKindExt::to_tpm_rc)?;

    let (sym_key, hmac_key) = wrap_keys(parent, &name)?;
    let iv = [0u8; 16];
    Encryptor::<Aes128>::new_from_slices(&sym_key, &iv)
        .map_err(|_| TpmRc::from(TpmRcBase::NoResult))?
        .encrypt(&mut enc_sensitive);
    let integrity = crypto_hmac(&hmac_key, &[&enc_sensitive, &name])
        .and_then(|mac| Tpm2bDigest::try_from(mac.as_slice()))
        .map_err(TpmErrorKindExt::to_tpm_rc)?;

    let mut private = build_to_vec(&integrity).map_err(TpmErrorKindExt::to_tpm_rc)?;
    private.extend(enc_sensitive);

    mocktpm_ok(TpmResponseBody::Create(TpmCreateResponse {
        out_private: Tpm2bPrivate::try_from(private.as_slice())
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
        out_public: Tpm2bPublic { inner: public },
        creation_data: Tpm2bCreationData::default(),
        creation_hash: TpmBuffer::default(),
        creation_ticket: TpmtTkCreation::default(),
    }))
}

fn mocktpm_load(
    tpm: &mut MockTpmState,
    cmd: &TpmLoadCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let parent = storage_parent(tpm, cmd.parent_handle.0)?;
    let public = cmd.in_public.inner.clone();
    check_ecc_template(&public)?;
    let TpmuPublicId::Ecc(unique) = &public.unique else {
        return Err(mocktpm_rc(TpmRcBase::Type, RC_P + RC_2));
    };
    let name = crypto_make_name(&public).map_err(TpmErrorKindExt::to_tpm_rc)?;

    let (integrity, enc_sensitive) = Tpm2bDigest::parse(&cmd.in_private)
        .map_err(|_| mocktpm_rc(TpmRcBase::Size, RC_P + RC_1))?;
    let (sym_key, hmac_key) = wrap_keys(parent, &name)?;
    crypto_hmac_verify(&hmac_key, &[enc_sensitive, &name], &integrity)
        .map_err(|_| mocktpm_rc(TpmRcBase::Integrity, RC_P + RC_1))?;

    let mut sensitive = enc_sensitive.to_vec();
    let iv = [0u8; 16];
    Decryptor::<Aes128>::new_from_slices(&sym_key, &iv)
        .map_err(|_| TpmRc::from(TpmRcBase::NoResult))?
        .decrypt(&mut sensitive);
    let (sensitive, trailing) =
        TpmtSensitive::parse(&sensitive).map_err(|_| TpmRc::from(TpmRcBase::Sensitive))?;
    if !trailing.is_empty() {
        return Err(TpmRc::from(TpmRcBase::Sensitive));
    }
    let TpmuSensitiveComposite::Ecc(scalar) = &sensitive.sensitive else {
        return Err(TpmRc::from(TpmRcBase::Sensitive));
    };

    let secret = SecretKey::from_slice(scalar).map_err(|_| TpmRc::from(TpmRcBase::Sensitive))?;
    let derived = ecc_point(&secret)?;
    if *derived.x != *unique.x || *derived.y != *unique.y {
        return Err(mocktpm_rc(TpmRcBase::Binding, RC_P + RC_2));
    }

    let name = to_name(&name)?;
    let handle = tpm.insert_object(MockTpmObject {
        public,
        secret,
        seed: Vec::new(),
    })?;
    mocktpm_ok(TpmResponseBody::Load(TpmLoadResponse {
        object_handle: TpmTransient(handle),
        name,
    }))
}

fn mocktpm_sign(
    tpm: &mut MockTpmState,
    cmd: &TpmSignCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let key_handle = cmd.key_handle.0;
    let Some(key) = tpm.objects.get(&key_handle) else {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_1));
    };
    let attrs = key.public.object_attributes;
    if !attrs.contains(TpmaObject::SIGN_ENCRYPT) || attrs.contains(TpmaObject::RESTRICTED) {
        return Err(mocktpm_rc(TpmRcBase::Key, RC_1));
    }
    let sha256 = matches!(
        &cmd.in_scheme.details,
        TpmuSigScheme::Any(details) if details.hash_alg == TpmAlgId::Sha256
    );
    if cmd.in_scheme.scheme != TpmAlgId::Ecdsa || !sha256 {
        return Err(mocktpm_rc(TpmRcBase::Scheme, RC_P + RC_2));
    }
    if cmd.digest.len() != 32 {
        return Err(mocktpm_rc(TpmRcBase::Size, RC_P + RC_1));
    }

    let signing_key = SigningKey::from(&key.secret);
    let signature: Signature = signing_key
        .sign_prehash(&cmd.digest)
        .map_err(|_| TpmRc::from(TpmRcBase::NoResult))?;
    let (r, s) = signature.split_bytes();
    tpm.last_signature = Some((r.to_vec(), s.to_vec()));

    mocktpm_ok(TpmResponseBody::Sign(TpmSignResponse {
        signature: TpmtSignature {
            sig_alg: TpmAlgId::Ecdsa,
            signature: TpmuSignature::Ecdsa(TpmsSignatureEcc {
                hash: TpmAlgId::Sha256,
                signature_r: Tpm2bEccParameter::try_from(r.as_slice())
                    .map_err(TpmErrorKindExt::to_tpm_rc)?,
                signature_s: Tpm2bEccParameter::try_from(s.as_slice())
                    .map_err(TpmErrorKindExt::to_tpm_rc)?,
            }),
        },
    }))
}

fn mocktpm_flush_context(
    tpm: &mut MockTpmState,
    cmd: &TpmFlushContextCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    if tpm.objects.remove(&cmd.flush_handle).is_none() {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_P + RC_1));
    }
    mocktpm_ok(TpmResponseBody::FlushContext(TpmFlushContextResponse {}))
}

fn mocktpm_nv_read_public(
    tpm: &mut MockTpmState,
    cmd: &TpmNvReadPublicCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let Some(index) = tpm.nv_indices.get(&cmd.nv_index) else {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_1));
    };
    let name = crypto_make_nv_name(&index.public).map_err(TpmErrorKindExt::to_tpm_rc)?;
    mocktpm_ok(TpmResponseBody::NvReadPublic(TpmNvReadPublicResponse {
        nv_public: Tpm2bNvPublic {
            inner: index.public.clone(),
        },
        nv_name: to_name(&name)?,
    }))
}

fn mocktpm_nv_define_space(
    tpm: &mut MockTpmState,
    cmd: &TpmNvDefineSpaceCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    if cmd.auth_handle.0 != TpmRh::Owner as u32 {
        return Err(mocktpm_rc(TpmRcBase::Hierarchy, RC_1));
    }
    let public = cmd.public_info.inner.clone();
    let index = public.nv_index;
    if tpm.nv_indices.contains_key(&index) {
        return Err(TpmRc::from(TpmRcBase::NvDefined));
    }
    if public.attributes.bits() & TPMA_NV_WRITTEN != 0 {
        return Err(mocktpm_rc(TpmRcBase::Attributes, RC_P + RC_2));
    }
    if nv_index_type(public.attributes) == TpmNt::Counter && public.data_size != 8 {
        return Err(mocktpm_rc(TpmRcBase::Size, RC_P + RC_2));
    }
    tpm.nv_indices.insert(
        index,
        MockTpmNvIndex {
            public,
            data: Vec::new(),
        },
    );
    mocktpm_ok(TpmResponseBody::NvDefineSpace(TpmNvDefineSpaceResponse {}))
}

fn mocktpm_nv_increment(
    tpm: &mut MockTpmState,
    cmd: &TpmNvIncrementCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let Some(index) = tpm.nv_indices.get_mut(&cmd.nv_index) else {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_2));
    };
    if nv_index_type(index.public.attributes) != TpmNt::Counter {
        return Err(mocktpm_rc(TpmRcBase::Attributes, RC_2));
    }
    let current = <[u8; 8]>::try_from(index.data.as_slice())
        .map(u64::from_be_bytes)
        .unwrap_or(0);
    let next = current
        .checked_add(1)
        .ok_or(TpmRc::from(TpmRcBase::NvRange))?;
    index.data = next.to_be_bytes().to_vec();
    index.public.attributes =
        TpmaNv::from_bits_truncate(index.public.attributes.bits() | TPMA_NV_WRITTEN);
    mocktpm_ok(TpmResponseBody::NvIncrement(TpmNvIncrementResponse {}))
}

fn mocktpm_nv_read(
    tpm: &mut MockTpmState,
    cmd: &TpmNvReadCommand,
    _sessions: &[TpmsAuthCommand],
) -> MockTpmResult {
    let Some(index) = tpm.nv_indices.get(&cmd.nv_index) else {
        return Err(mocktpm_rc(TpmRcBase::Handle, RC_2));
    };
    if !index.is_written() {
        return Err(TpmRc::from(TpmRcBase::NvUninitialized));
    }
    let start = usize::from(cmd.offset);
    let end = start + usize::from(cmd.size);
    if end > index.data.len() {
        return Err(TpmRc::from(TpmRcBase::NvRange));
    }
    mocktpm_ok(TpmResponseBody::NvRead(TpmNvReadResponse {
        data: Tpm2bMaxNvBuffer::try_from(&index.data[start..end])
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_build_response(response: MockTpmResult) -> Result<Vec<u8>, TpmRc> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        match response {
            Ok((rc, response_body, auth_responses)) => {
                response_body.build(&mut writer, rc, &auth_responses)?;
            }
            Err(rc) => {
                tpm_build_response(&TpmFlushContextResponse {}, &[], rc, &mut writer)
                    .map_err(TpmErrorKindExt::to_tpm_rc)?;
            }
        }
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

fn mocktpm_run(mut stream: impl Read + Write, state: &Mutex<MockTpmState>) {
    loop {
        let mut header = [0u8; TPM_HEADER_SIZE];
        if stream.read_exact(&mut header).is_err() {
            break;
        }

        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if !(TPM_HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            error!("Invalid command size: {size}");
            break;
        }

        let mut command_buf = header.to_vec();
        command_buf.resize(size, 0);

        if let Err(e) = stream.read_exact(&mut command_buf[TPM_HEADER_SIZE..]) {
            error!("{e}");
            break;
        }

        let response = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let result = state.parse(&command_buf);
            if let Err(rc) = &result {
                debug!("{rc}");
            }
            mocktpm_build_response(result)
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                error!("{e}");
                break;
            }
        };

        if stream.write_all(&response).is_err() || stream.flush().is_err() {
            error!("no response");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::TpmDevice,
        error::TpmRcExt,
        hierarchy::primary_template,
        key::{child_template, empty_sensitive},
        session::password_session,
    };
    use tpm2_protocol::data::{Tpm2bData, TpmlPcrSelection};

    const OWNER: u32 = TpmRh::Owner as u32;

    fn create_primary(device: &mut TpmDevice, hierarchy: u32) -> Result<u32, TpmDeviceError> {
        let cmd = TpmCreatePrimaryCommand {
            primary_handle: hierarchy.into(),
            in_sensitive: empty_sensitive(),
            in_public: Tpm2bPublic {
                inner: primary_template(),
            },
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::default(),
        };
        let (resp, _) = device.execute(&cmd, &password_session())?;
        match resp {
            TpmResponseBody::CreatePrimary(resp) => Ok(resp.object_handle.0),
            _ => Err(TpmDeviceError::UnexpectedResponse("CreatePrimary".into())),
        }
    }

    #[test]
    fn test_object_memory_exhaustion() {
        let mock = MockTpm::new();
        let mut device = TpmDevice::new(mock.connect().unwrap());
        for _ in 0..MOCKTPM_TRANSIENT_SLOTS {
            create_primary(&mut device, OWNER).unwrap();
        }
        let err = create_primary(&mut device, OWNER).unwrap_err();
        let rc = err.rc().unwrap();
        assert_eq!(rc.value(), 0x902);
        assert!(rc.is_warning());
    }

    #[test]
    fn test_tampered_private_fails_integrity() {
        let mock = MockTpm::new();
        let mut device = TpmDevice::new(mock.connect().unwrap());
        let parent = create_primary(&mut device, OWNER).unwrap();
        let cmd = TpmCreateCommand {
            parent_handle: parent.into(),
            in_sensitive: empty_sensitive(),
            in_public: Tpm2bPublic {
                inner: child_template(),
            },
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::default(),
        };
        let (resp, _) = device.execute(&cmd, &password_session()).unwrap();
        let TpmResponseBody::Create(created) = resp else {
            panic!("unexpected response");
        };

        let mut private = created.out_private.to_vec();
        let last = private.len() - 1;
        private[last] ^= 0x01;
        let cmd = TpmLoadCommand {
            parent_handle: parent.into(),
            in_private: Tpm2bPrivate::try_from(private.as_slice()).unwrap(),
            in_public: created.out_public,
        };
        let err = device.execute(&cmd, &password_session()).unwrap_err();
        assert_eq!(
            err.rc().map(|rc| rc.base_value()),
            Some(TpmRcBase::Integrity as u32)
        );
        assert_eq!(mock.transient_handles(), vec![parent]);
    }

    #[test]
    fn test_unsupported_command() {
        let mock = MockTpm::new();
        let mut transport = mock.connect().unwrap();
        // TPM2_GetRandom of 8 bytes
        transport
            .send(&[0x80, 0x01, 0, 0, 0, 12, 0, 0, 0x01, 0x7B, 0, 8])
            .unwrap();
        let response = transport.receive().unwrap();
        assert_eq!(&response[6..10], &0x143u32.to_be_bytes());
    }
}
