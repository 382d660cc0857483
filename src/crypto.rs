// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{key::ECC_COORDINATE_SIZE, util::build_to_vec};
use hmac::{Hmac, Mac};
use p256::{ecdsa::Signature, FieldBytes};
use sha2::{Digest, Sha256};
use tpm2_protocol::{
    data::{TpmAlgId, TpmsNvPublic, TpmtPublic},
    TpmErrorKind,
};

pub const KDF_LABEL_INTEGRITY: &str = "INTEGRITY";
pub const KDF_LABEL_STORAGE: &str = "STORAGE";

/// User presence flag of an authentication signature.
pub const U2F_USER_PRESENT: u8 = 0x01;

pub const U2F_COUNTER_SIZE: usize = 4;

/// Computes the U2F authentication digest
/// `SHA-256(application || 0x01 || counter || challenge)`.
#[must_use]
pub fn u2f_digest(
    application: &[u8; 32],
    counter: [u8; U2F_COUNTER_SIZE],
    challenge: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(application);
    hasher.update([U2F_USER_PRESENT]);
    hasher.update(counter);
    hasher.update(challenge);
    hasher.finalize().into()
}

/// DER encodes an ECDSA signature from big-endian `r` and `s`.
///
/// # Errors
///
/// Returns `TpmErrorKind::InvalidValue` if a component is longer than the
/// curve order, zero, or out of range.
pub fn der_signature(r: &[u8], s: &[u8]) -> Result<Vec<u8>, TpmErrorKind> {
    let r = field_bytes(r)?;
    let s = field_bytes(s)?;
    let signature = Signature::from_scalars(r, s).map_err(|_| TpmErrorKind::InvalidValue)?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Parses a DER ECDSA signature back into fixed-width `r` and `s`.
///
/// # Errors
///
/// Returns `TpmErrorKind::InvalidValue` on malformed DER.
pub fn der_signature_parse(
    der: &[u8],
) -> Result<([u8; ECC_COORDINATE_SIZE], [u8; ECC_COORDINATE_SIZE]), TpmErrorKind> {
    let signature = Signature::from_der(der).map_err(|_| TpmErrorKind::InvalidValue)?;
    let (r, s) = signature.split_bytes();
    let mut r_out = [0u8; ECC_COORDINATE_SIZE];
    let mut s_out = [0u8; ECC_COORDINATE_SIZE];
    r_out.copy_from_slice(&r);
    s_out.copy_from_slice(&s);
    Ok((r_out, s_out))
}

fn field_bytes(bytes: &[u8]) -> Result<FieldBytes, TpmErrorKind> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    if bytes.len() > ECC_COORDINATE_SIZE {
        return Err(TpmErrorKind::InvalidValue);
    }
    let mut out = FieldBytes::default();
    out[ECC_COORDINATE_SIZE - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

/// Computes HMAC-SHA256 over the concatenation of `data`.
///
/// # Errors
///
/// Returns `TpmErrorKind::InvalidValue` if the key is rejected.
pub fn crypto_hmac(key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>, TpmErrorKind> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| TpmErrorKind::InvalidValue)?;
    for chunk in data {
        mac.update(chunk);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verifies HMAC-SHA256 in constant time.
///
/// # Errors
///
/// Returns `TpmErrorKind::InvalidValue` if the MAC does not match.
pub fn crypto_hmac_verify(key: &[u8], data: &[&[u8]], expected: &[u8]) -> Result<(), TpmErrorKind> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| TpmErrorKind::InvalidValue)?;
    for chunk in data {
        mac.update(chunk);
    }
    mac.verify_slice(expected)
        .map_err(|_| TpmErrorKind::InvalidValue)
}

/// `KDFa` with HMAC-SHA256 in counter mode (TPM 2.0 Part 1, 11.4.10.2).
///
/// # Errors
///
/// Returns `TpmErrorKind::InvalidValue` if `bits` is zero.
pub fn crypto_kdfa(
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>, TpmErrorKind> {
    if bits == 0 {
        return Err(TpmErrorKind::InvalidValue);
    }
    let len = bits.div_ceil(8) as usize;
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        counter += 1;
        let block = crypto_hmac(
            key,
            &[
                &counter.to_be_bytes(),
                label.as_bytes(),
                &[0],
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ],
        )?;
        out.extend(block);
    }
    out.truncate(len);
    Ok(out)
}

/// Computes the name of an object: `nameAlg || H(TPMT_PUBLIC)`.
///
/// # Errors
///
/// Returns a `TpmErrorKind` if the public area cannot be marshaled or uses
/// an unsupported name algorithm.
pub fn crypto_make_name(public: &TpmtPublic) -> Result<Vec<u8>, TpmErrorKind> {
    make_name(public.name_alg, &build_to_vec(public)?)
}

/// Computes the name of an NV index: `nameAlg || H(TPMS_NV_PUBLIC)`.
///
/// # Errors
///
/// Returns a `TpmErrorKind` if the public area cannot be marshaled or uses
/// an unsupported name algorithm.
pub fn crypto_make_nv_name(public: &TpmsNvPublic) -> Result<Vec<u8>, TpmErrorKind> {
    make_name(public.name_alg, &build_to_vec(public)?)
}

fn make_name(name_alg: TpmAlgId, bytes: &[u8]) -> Result<Vec<u8>, TpmErrorKind> {
    if name_alg != TpmAlgId::Sha256 {
        return Err(TpmErrorKind::InvalidValue);
    }
    let mut name = (name_alg as u16).to_be_bytes().to_vec();
    name.extend_from_slice(&Sha256::digest(bytes));
    Ok(name)
}
