// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Counter Manager.
//!
//! The use counter lives in an owner-authorized NV counter index. The index
//! is defined on first use; the TPM guarantees it only ever counts up.

use crate::{
    device::ARTIFACT_PUBLIC_PREFIX,
    error::{TpmDeviceError, TpmError},
    session::{password_session, Session},
    tpm::{
        nv_attributes, nv_index_type, TpmNt, TPMA_NV_AUTHREAD, TPMA_NV_AUTHWRITE, TPMA_NV_NO_DA,
        TPMA_NV_OWNERREAD, TPMA_NV_OWNERWRITE,
    },
    util::build_to_vec,
};
use log::{debug, error, warn};
use tpm2_protocol::{
    data::{Tpm2bAuth, Tpm2bDigest, Tpm2bNvPublic, TpmAlgId, TpmCc, TpmRh, TpmaNv, TpmsNvPublic},
    message::{
        TpmNvDefineSpaceCommand, TpmNvIncrementCommand, TpmNvReadCommand, TpmNvReadPublicCommand,
    },
};

const OWNER: u32 = TpmRh::Owner as u32;

/// Index used when the caller does not name one.
pub const DEFAULT_COUNTER_INDEX: u32 = 0x0100_0101;

/// Size of the counter payload.
pub const COUNTER_SIZE: u16 = 8;

/// Attributes of a provisioned counter: owner and authorization read/write,
/// exempt from dictionary attack lockout.
#[must_use]
pub fn counter_attributes() -> TpmaNv {
    nv_attributes(
        TPMA_NV_OWNERWRITE
            | TPMA_NV_AUTHWRITE
            | TPMA_NV_OWNERREAD
            | TPMA_NV_AUTHREAD
            | TPMA_NV_NO_DA,
        TpmNt::Counter,
    )
}

/// Checks whether `index` exists and is a counter. The public area read
/// back is cached in the session scratch directory.
///
/// Returns `Ok(false)` if the index does not exist.
///
/// # Errors
///
/// Returns `TpmError::InvalidCounterType` if the index is not a counter and
/// `TpmError::Counter` for other TPM failures.
pub fn read_counter_public(session: &mut Session, index: u32) -> Result<bool, TpmError> {
    let cmd = TpmNvReadPublicCommand {
        nv_index: index.into(),
    };
    let result = session.execute(&cmd, &[]).and_then(|resp| {
        resp.NvReadPublic()
            .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::NvReadPublic))
    });
    let resp = match result {
        Ok(resp) => resp,
        Err(TpmDeviceError::HandleNotFound(rc)) => {
            debug!("NV index {index:#010x} does not exist: {rc}");
            return Ok(false);
        }
        Err(e) => {
            error!("TPM2_NV_ReadPublic {index:#010x}: {e}");
            return Err(TpmError::Counter(index, e));
        }
    };
    match build_to_vec(&resp.nv_public) {
        Ok(bytes) => session.save_artifact(ARTIFACT_PUBLIC_PREFIX, index, &bytes),
        Err(e) => warn!("NV index {index:#010x}: {e}"),
    }
    let found = nv_index_type(resp.nv_public.inner.attributes);
    if found != TpmNt::Counter {
        error!("NV index {index:#010x} is of type '{found}'");
        return Err(TpmError::InvalidCounterType { index, found });
    }
    Ok(true)
}

/// Reads the counter as a big-endian 64-bit value.
///
/// # Errors
///
/// Returns `TpmError::Counter` if the read fails or the payload has the
/// wrong size.
pub fn read_counter(session: &mut Session, index: u32) -> Result<u64, TpmError> {
    let cmd = TpmNvReadCommand {
        auth_handle: OWNER.into(),
        nv_index: index.into(),
        size: COUNTER_SIZE,
        offset: 0,
    };
    let resp = session
        .execute(&cmd, &password_session())
        .and_then(|resp| {
            resp.NvRead()
                .map_err(|_| TpmDeviceError::ResponseMismatch(TpmCc::NvRead))
        })
        .map_err(|e| {
            error!("TPM2_NV_Read {index:#010x}: {e}");
            TpmError::Counter(index, e)
        })?;
    let data: &[u8] = &resp.data;
    let bytes: [u8; COUNTER_SIZE as usize] = data.try_into().map_err(|_| {
        TpmError::Counter(
            index,
            TpmDeviceError::UnexpectedResponse(format!("{} byte counter", data.len())),
        )
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Increments the counter and returns the new value, or `None` if the index
/// does not exist.
///
/// # Errors
///
/// Returns `TpmError::InvalidCounterType` or `TpmError::Counter`.
pub fn increment_counter(session: &mut Session, index: u32) -> Result<Option<u64>, TpmError> {
    if !read_counter_public(session, index)? {
        return Ok(None);
    }
    let cmd = TpmNvIncrementCommand {
        auth_handle: OWNER.into(),
        nv_index: index.into(),
    };
    match session.execute(&cmd, &password_session()) {
        Ok(_) => {}
        Err(TpmDeviceError::HandleNotFound(rc)) => {
            debug!("NV index {index:#010x} vanished: {rc}");
            return Ok(None);
        }
        Err(e) => {
            error!("TPM2_NV_Increment {index:#010x}: {e}");
            return Err(TpmError::Counter(index, e));
        }
    }
    read_counter(session, index).map(Some)
}

/// Defines a new counter index.
///
/// # Errors
///
/// Returns `TpmError::CounterProvision` if the TPM refuses the definition.
pub fn define_counter(session: &mut Session, index: u32) -> Result<(), TpmError> {
    let cmd = TpmNvDefineSpaceCommand {
        auth_handle: OWNER.into(),
        auth: Tpm2bAuth::default(),
        public_info: Tpm2bNvPublic {
            inner: TpmsNvPublic {
                nv_index: index.into(),
                name_alg: TpmAlgId::Sha256,
                attributes: counter_attributes(),
                auth_policy: Tpm2bDigest::default(),
                data_size: COUNTER_SIZE,
            },
        },
    };
    session.execute(&cmd, &password_session()).map_err(|e| {
        error!("TPM2_NV_DefineSpace {index:#010x}: {e}");
        TpmError::CounterProvision(index, e)
    })?;
    debug!("defined counter {index:#010x}");
    Ok(())
}

/// Increments the counter at `index`, or [`DEFAULT_COUNTER_INDEX`], defining
/// it first if it does not exist, and returns the low 32 bits of the new
/// value.
///
/// Counter values above `u32::MAX` alias: the protocol counter field is 32
/// bits wide and the truncation is a plain `as u32`.
///
/// # Errors
///
/// Returns `TpmError::CounterProvision` if the index cannot be defined, and
/// `TpmError::InvalidCounterType` or `TpmError::Counter` for other failures.
pub fn get_or_create_counter(session: &mut Session, index: Option<u32>) -> Result<u32, TpmError> {
    let index = index.unwrap_or(DEFAULT_COUNTER_INDEX);
    let result = increment_or_provision(session, index);
    session.remove_artifacts(index);
    #[allow(clippy::cast_possible_truncation)]
    result.map(|value| value as u32)
}

fn increment_or_provision(session: &mut Session, index: u32) -> Result<u64, TpmError> {
    if let Some(value) = increment_counter(session, index)? {
        return Ok(value);
    }
    define_counter(session, index)?;
    increment_counter(session, index)?.ok_or_else(|| {
        TpmError::CounterProvision(
            index,
            TpmDeviceError::UnexpectedResponse("counter missing after definition".to_string()),
        )
    })
}
