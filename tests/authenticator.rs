// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use rstest::{fixture, rstest};
use std::{path::Path, sync::Arc};
use tempfile::TempDir;
use tpm2_protocol::data::TpmRh;
use tpm2_u2f::{
    crypto::{der_signature_parse, u2f_digest},
    key::KeyBlob,
    mocktpm::MockTpm,
    Authenticator, Config, EccPoint, ParentRef, TpmError, U2fAuthenticateRequest,
};

const TPM_RH_OWNER: u32 = TpmRh::Owner as u32;
const TPM_RH_ENDORSEMENT: u32 = TpmRh::Endorsement as u32;

const APPLICATION: [u8; 32] = [0x00; 32];
const CHALLENGE: [u8; 32] = [0x42; 32];

struct TestFixture {
    runtime: TempDir,
    mock: MockTpm,
    authenticator: Authenticator,
}

impl TestFixture {
    fn assert_clean(&self) {
        assert!(self.mock.transient_handles().is_empty());
        assert_eq!(scratch_entries(self.runtime.path()), 0);
    }
}

fn scratch_entries(path: &Path) -> usize {
    std::fs::read_dir(path).unwrap().count()
}

#[fixture]
fn tpm() -> TestFixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = tempfile::tempdir().unwrap();
    let mock = MockTpm::new();
    let config = Config::default().with_runtime_dir(runtime.path());
    let authenticator = Authenticator::new(config, Box::new(mock.clone()));
    TestFixture {
        runtime,
        mock,
        authenticator,
    }
}

fn verify(public: &EccPoint, counter: [u8; 4], der: &[u8]) -> bool {
    let key = VerifyingKey::from_sec1_bytes(&public.to_uncompressed()).unwrap();
    let signature = Signature::from_der(der).unwrap();
    let digest = u2f_digest(&APPLICATION, counter, &CHALLENGE);
    key.verify_prehash(&digest, &signature).is_ok()
}

#[rstest]
fn test_generate_and_verify(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    assert!(!key.key_blob.is_empty());
    assert!(key.key_blob.len() <= 255);
    assert!(tpm
        .authenticator
        .verify_loadable(ParentRef::Default, &key.key_blob));
    assert!(tpm
        .authenticator
        .verify_loadable(ParentRef::Hierarchy(TPM_RH_OWNER), &key.key_blob));
    tpm.assert_clean();
}

#[rstest]
fn test_keys_are_distinct(tpm: TestFixture) {
    let a = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let b = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    assert_ne!(a.public, b.public);
    assert_ne!(a.key_blob, b.key_blob);
}

#[rstest]
fn test_wrong_parent(tpm: TestFixture) {
    let key = tpm
        .authenticator
        .generate_key(ParentRef::Hierarchy(TPM_RH_OWNER))
        .unwrap();
    let other = ParentRef::Hierarchy(TPM_RH_ENDORSEMENT);
    assert!(!tpm.authenticator.verify_loadable(other, &key.key_blob));
    assert!(matches!(
        tpm.authenticator.check_key(other, &key.key_blob),
        Err(TpmError::KeyLoad(_))
    ));
    assert!(matches!(
        tpm.authenticator
            .sign(other, None, &APPLICATION, &CHALLENGE, &key.key_blob),
        Err(TpmError::KeyLoad(_))
    ));
    tpm.assert_clean();
}

enum SizeField {
    Public,
    Private,
}

#[rstest]
#[case::public_size_high(SizeField::Public, 0, 0xFF)]
#[case::public_size_low(SizeField::Public, 1, 0x01)]
#[case::private_size_high(SizeField::Private, 0, 0x80)]
#[case::private_size_low(SizeField::Private, 1, 0x01)]
fn test_corrupted_size_field(
    tpm: TestFixture,
    #[case] field: SizeField,
    #[case] byte: usize,
    #[case] mask: u8,
) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let mut blob = key.key_blob;
    let offset = match field {
        SizeField::Public => 0,
        SizeField::Private => 2 + usize::from(u16::from_be_bytes([blob[0], blob[1]])),
    };
    blob[offset + byte] ^= mask;
    assert!(matches!(
        KeyBlob::from_bytes(&blob),
        Err(TpmError::KeyBlobDecode(_))
    ));
    assert!(matches!(
        tpm.authenticator.check_key(ParentRef::Default, &blob),
        Err(TpmError::KeyBlobDecode(_))
    ));
    assert!(!tpm.authenticator.verify_loadable(ParentRef::Default, &blob));
    tpm.assert_clean();
}

#[rstest]
fn test_empty_blob(tpm: TestFixture) {
    assert!(!tpm.authenticator.verify_loadable(ParentRef::Default, &[]));
    tpm.assert_clean();
}

#[rstest]
fn test_first_signature(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let assertion = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            None,
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap();
    assert_eq!(assertion.counter, [0, 0, 0, 1]);
    assert_eq!(assertion.signature[0], 0x30);
    assert!(verify(&key.public, assertion.counter, &assertion.signature));
    assert!(!verify(&key.public, [0, 0, 0, 2], &assertion.signature));
    assert!(tpm
        .authenticator
        .verify_loadable(ParentRef::Default, &key.key_blob));
    tpm.assert_clean();
}

#[rstest]
fn test_counter_is_monotonic(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    for expected in 1..=10u32 {
        let assertion = tpm
            .authenticator
            .sign(
                ParentRef::Default,
                None,
                &APPLICATION,
                &CHALLENGE,
                &key.key_blob,
            )
            .unwrap();
        assert_eq!(assertion.counter, expected.to_be_bytes());
    }
    tpm.assert_clean();
}

#[rstest]
fn test_counter_index_is_selectable(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    tpm.mock.set_counter(0x0100_0200, 41);
    let assertion = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            Some(0x0100_0200),
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap();
    assert_eq!(assertion.counter, [0, 0, 0, 42]);
    assert_eq!(tpm.mock.nv_indices(), vec![0x0100_0200]);
}

#[rstest]
fn test_signatures_differ(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let a = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            Some(0x0100_0300),
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap();
    let b = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            Some(0x0100_0300),
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap();
    assert_ne!(a.counter, b.counter);
    assert_ne!(a.signature, b.signature);
    assert!(verify(&key.public, a.counter, &a.signature));
    assert!(verify(&key.public, b.counter, &b.signature));
}

#[rstest]
fn test_der_matches_tpm_signature(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let assertion = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            None,
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap();
    let (r, s) = tpm.mock.last_signature().unwrap();
    let (der_r, der_s) = der_signature_parse(&assertion.signature).unwrap();
    assert_eq!(der_r.as_slice(), r.as_slice());
    assert_eq!(der_s.as_slice(), s.as_slice());
}

#[rstest]
fn test_failed_load_does_not_touch_counter(tpm: TestFixture) {
    let key = tpm
        .authenticator
        .generate_key(ParentRef::Hierarchy(TPM_RH_OWNER))
        .unwrap();
    let result = tpm.authenticator.sign(
        ParentRef::Hierarchy(TPM_RH_ENDORSEMENT),
        None,
        &APPLICATION,
        &CHALLENGE,
        &key.key_blob,
    );
    assert!(result.is_err());
    assert!(tpm.mock.nv_indices().is_empty());
}

#[rstest]
fn test_counter_of_wrong_type(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    tpm.mock.define_ordinary(0x0100_0400, 8);
    let err = tpm
        .authenticator
        .sign(
            ParentRef::Default,
            Some(0x0100_0400),
            &APPLICATION,
            &CHALLENGE,
            &key.key_blob,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        TpmError::InvalidCounterType {
            index: 0x0100_0400,
            ..
        }
    ));
    tpm.assert_clean();
}

#[rstest]
fn test_register_and_authenticate(tpm: TestFixture) {
    let registration = tpm.authenticator.register();
    let public = registration.public_key.unwrap();

    let request =
        U2fAuthenticateRequest::new(CHALLENGE, APPLICATION, &registration.key_handle).unwrap();
    let response = tpm.authenticator.authenticate(&request);
    assert_eq!(response.user_presence, 0x01);
    assert_eq!(response.counter, [0, 0, 0, 1]);
    assert!(verify(&public, response.counter, &response.signature));
}

#[rstest]
fn test_authenticate_failure_has_empty_signature(tpm: TestFixture) {
    let request = U2fAuthenticateRequest::new(CHALLENGE, APPLICATION, &[0xAA; 16]).unwrap();
    let response = tpm.authenticator.authenticate(&request);
    assert!(response.signature.is_empty());
    assert!(tpm.mock.nv_indices().is_empty());
    tpm.assert_clean();
}

#[test]
fn test_unreachable_backend() {
    let runtime = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_runtime_dir(runtime.path())
        .with_target(tpm2_u2f::TpmTarget::Device(runtime.path().join("tpmrm0")));
    let authenticator = Authenticator::from_config(config);
    assert!(matches!(
        authenticator.generate_key(ParentRef::Default),
        Err(TpmError::BackendInit(_))
    ));
    let registration = authenticator.register();
    assert!(registration.public_key.is_none());
    assert!(registration.key_handle.is_empty());
}

#[rstest]
fn test_concurrent_signing(tpm: TestFixture) {
    let key = tpm.authenticator.generate_key(ParentRef::Default).unwrap();
    let authenticator = Arc::new(tpm.authenticator);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let authenticator = Arc::clone(&authenticator);
            let blob = key.key_blob.clone();
            std::thread::spawn(move || {
                (0..3)
                    .map(|_| {
                        authenticator
                            .sign(ParentRef::Default, None, &APPLICATION, &CHALLENGE, &blob)
                            .unwrap()
                            .counter
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counters: Vec<u32> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .map(u32::from_be_bytes)
        .collect();
    counters.sort_unstable();
    assert_eq!(counters, (1..=12).collect::<Vec<_>>());
    assert!(tpm.mock.transient_handles().is_empty());
}
