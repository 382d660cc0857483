// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Session Manager.
//!
//! A [`Session`] is one backend connection plus a private scratch directory,
//! scoped to a single authenticator operation. Transient objects created
//! through the session are tracked, and whatever the operation did not flush
//! itself is flushed when the session closes.

use crate::{
    device::{TpmDevice, ARTIFACT_CONTEXT_PREFIX},
    error::{TpmDeviceError, TpmError},
    transport::Connector,
};
use log::{debug, warn};
use std::path::Path;
use tempfile::TempDir;
use tpm2_protocol::{
    data::{Tpm2bAuth, Tpm2bNonce, TpmRh, TpmaSession, TpmsAuthCommand},
    message::{TpmCommandBuild, TpmFlushContextCommand, TpmHeader, TpmResponseBody},
    TpmSession,
};

pub const SCRATCH_PREFIX: &str = "tss2.";

/// Builds the authorization area of an empty password session.
#[must_use]
pub fn password_session() -> Vec<TpmsAuthCommand> {
    vec![TpmsAuthCommand {
        session_handle: TpmSession(TpmRh::Pw as u32),
        nonce: Tpm2bNonce::default(),
        session_attributes: TpmaSession::empty(),
        hmac: Tpm2bAuth::default(),
    }]
}

#[derive(Debug)]
pub struct Session {
    device: TpmDevice,
    scratch: Option<TempDir>,
    transients: Vec<u32>,
}

impl Session {
    /// Creates a scratch directory under `runtime_dir` and connects to the
    /// TPM.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::BackendInit` if the directory cannot be created or
    /// the connection cannot be established.
    pub fn open(connector: &dyn Connector, runtime_dir: &Path) -> Result<Self, TpmError> {
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(runtime_dir)
            .map_err(|e| TpmError::BackendInit(TpmDeviceError::Io(e)))?;
        let transport = connector.connect().map_err(TpmError::BackendInit)?;
        debug!("session opened in {}", scratch.path().display());
        Ok(Self {
            device: TpmDevice::new(transport).with_artifact_dir(scratch.path()),
            scratch: Some(scratch),
            transients: Vec::new(),
        })
    }

    #[must_use]
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Transient handles created in this session and not yet flushed.
    #[must_use]
    pub fn transients(&self) -> &[u32] {
        &self.transients
    }

    /// Executes a command. An object the command loads is tracked and its
    /// name is cached in the scratch directory until it is flushed.
    ///
    /// # Errors
    ///
    /// Returns the `TpmDeviceError` of the round trip.
    pub fn execute<C: TpmHeader + TpmCommandBuild>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<TpmResponseBody, TpmDeviceError> {
        let (response, _) = self.device.execute(command, sessions)?;
        let loaded = match &response {
            TpmResponseBody::CreatePrimary(resp) => {
                Some((resp.object_handle.0, resp.name.to_vec()))
            }
            TpmResponseBody::Load(resp) => Some((resp.object_handle.0, resp.name.to_vec())),
            _ => None,
        };
        if let Some((handle, name)) = loaded {
            self.transients.push(handle);
            self.device
                .save_artifact(ARTIFACT_CONTEXT_PREFIX, handle, &name);
        }
        Ok(response)
    }

    /// Caches a metadata file for `handle` in the scratch directory.
    pub fn save_artifact(&self, prefix: &str, handle: u32, bytes: &[u8]) {
        self.device.save_artifact(prefix, handle, bytes);
    }

    /// Flushes a transient object.
    ///
    /// # Errors
    ///
    /// Returns the `TpmDeviceError` of the flush.
    pub fn flush(&mut self, handle: u32) -> Result<(), TpmDeviceError> {
        let cmd = TpmFlushContextCommand {
            flush_handle: handle.into(),
        };
        let result = self.device.execute(&cmd, &[]);
        if result.is_ok() || matches!(result, Err(TpmDeviceError::HandleNotFound(_))) {
            self.transients.retain(|h| *h != handle);
        }
        result.map(|_| ())
    }

    /// Removes the artifact files associated with a handle.
    pub fn remove_artifacts(&self, handle: u32) {
        self.device.remove_artifacts(handle);
    }

    /// Closes the session. Equivalent to dropping it.
    pub fn close(self) {}

    fn teardown(&mut self) {
        for handle in std::mem::take(&mut self.transients) {
            debug!("flushing leftover {handle:#010x}");
            let cmd = TpmFlushContextCommand {
                flush_handle: handle.into(),
            };
            if let Err(e) = self.device.execute(&cmd, &[]) {
                warn!("flush {handle:#010x}: {e}");
            }
            self.device.remove_artifacts(handle);
        }

        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            match scratch.close() {
                Ok(()) => debug!("session closed, removed {}", path.display()),
                Err(e) => warn!("{}: {e}", path.display()),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::artifact_file_name, hierarchy::create_primary, mocktpm::MockTpm};

    const OWNER: u32 = TpmRh::Owner as u32;

    #[test]
    fn test_scratch_dir_lifecycle() {
        let runtime = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        let session = Session::open(&mock, runtime.path()).unwrap();
        let scratch = session.scratch_dir().unwrap().to_path_buf();
        assert!(scratch.is_dir());
        assert!(scratch
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCRATCH_PREFIX));
        session.close();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_leftover_transients_flushed_on_drop() {
        let runtime = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        {
            let mut session = Session::open(&mock, runtime.path()).unwrap();
            let handle = create_primary(&mut session, OWNER).unwrap();
            assert_eq!(session.transients(), &[handle]);
            assert_eq!(mock.transient_handles(), vec![handle]);
        }
        assert!(mock.transient_handles().is_empty());
        assert_eq!(std::fs::read_dir(runtime.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_loaded_object_name_is_cached_until_release() {
        let runtime = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        let mut session = Session::open(&mock, runtime.path()).unwrap();
        let handle = create_primary(&mut session, OWNER).unwrap();
        let cached = session
            .scratch_dir()
            .unwrap()
            .join(artifact_file_name(ARTIFACT_CONTEXT_PREFIX, handle));
        assert_eq!(
            std::fs::read(&cached).unwrap(),
            mock.object_name(handle).unwrap()
        );

        session.flush(handle).unwrap();
        session.remove_artifacts(handle);
        assert!(!cached.exists());
    }

    #[test]
    fn test_flush_untracks() {
        let runtime = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        let mut session = Session::open(&mock, runtime.path()).unwrap();
        let handle = create_primary(&mut session, OWNER).unwrap();
        session.flush(handle).unwrap();
        assert!(session.transients().is_empty());
        assert!(session.flush(handle).unwrap_err().is_handle_not_found());
    }

    #[test]
    fn test_missing_runtime_dir() {
        let runtime = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        let err = Session::open(&mock, &runtime.path().join("missing")).unwrap_err();
        assert!(matches!(err, TpmError::BackendInit(_)));
    }
}
