// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{error::TpmDeviceError, transport::Transport};
use log::{trace, warn};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tpm2_protocol::{
    data::{TpmSt, TpmsAuthCommand},
    message::{
        tpm_build_command, tpm_parse_response, TpmAuthResponses, TpmCommandBuild, TpmHeader,
        TpmResponseBody,
    },
    TpmWriter, TPM_MAX_COMMAND_SIZE,
};

/// Per-handle file holding the name of a loaded object.
pub const ARTIFACT_CONTEXT_PREFIX: &str = "h";
/// Per-handle file holding the public area of an NV index.
pub const ARTIFACT_PUBLIC_PREFIX: &str = "hp";

#[must_use]
pub fn artifact_file_name(prefix: &str, handle: u32) -> String {
    format!("{prefix}{handle:08x}.bin")
}

/// Executes commands over a transport.
///
/// When an artifact directory is set, the device keeps a metadata cache in
/// it, one file per live handle: `h<handle>.bin` for a loaded object and
/// `hp<handle>.bin` for an NV index whose public area was read. These are
/// the equivalent of the per-handle key files a TSS keeps beside a
/// connection. Whoever releases a handle removes its files, so an operation
/// that leaves its artifact directory empty has released every handle it
/// touched.
#[derive(Debug)]
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    artifact_dir: Option<PathBuf>,
}

impl TpmDevice {
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            artifact_dir: None,
        }
    }

    #[must_use]
    pub fn with_artifact_dir(mut self, dir: &Path) -> Self {
        self.artifact_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifact_dir.as_deref()
    }

    /// Sends a command to the TPM and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns `TpmDeviceError::HandleNotFound` if the TPM reports that a
    /// referenced handle does not exist, `TpmDeviceError::Rc` for any other
    /// response code, and I/O or protocol errors for transport failures.
    pub fn execute<C: TpmHeader + TpmCommandBuild>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<(TpmResponseBody, TpmAuthResponses), TpmDeviceError> {
        let mut command_buf = [0u8; TPM_MAX_COMMAND_SIZE];
        let len = {
            let mut writer = TpmWriter::new(&mut command_buf);
            let tag = if sessions.is_empty() {
                TpmSt::NoSessions
            } else {
                TpmSt::Sessions
            };
            tpm_build_command(command, tag, sessions, &mut writer)?;
            writer.len()
        };
        let command_bytes = &command_buf[..len];

        trace!("{:?} command: {}", C::COMMAND, hex::encode(command_bytes));
        self.transport.send(command_bytes)?;
        let resp_buf = self.transport.receive()?;
        trace!("{:?} response: {}", C::COMMAND, hex::encode(&resp_buf));

        match tpm_parse_response(C::COMMAND, &resp_buf)? {
            Ok((rc, response, auth)) => {
                if rc.is_warning() {
                    warn!("{:?}: {rc}", C::COMMAND);
                }
                Ok((response, auth))
            }
            Err((rc, _)) => Err(TpmDeviceError::from(rc)),
        }
    }

    /// Returns the artifact file paths associated with a handle.
    #[must_use]
    pub fn artifact_paths(&self, handle: u32) -> Vec<PathBuf> {
        let Some(dir) = &self.artifact_dir else {
            return Vec::new();
        };
        [ARTIFACT_CONTEXT_PREFIX, ARTIFACT_PUBLIC_PREFIX]
            .iter()
            .map(|prefix| dir.join(artifact_file_name(prefix, handle)))
            .collect()
    }

    /// Records metadata of a live handle. Write failures are logged.
    pub fn save_artifact(&self, prefix: &str, handle: u32, bytes: &[u8]) {
        let Some(dir) = &self.artifact_dir else {
            return;
        };
        let path = dir.join(artifact_file_name(prefix, handle));
        match fs::write(&path, bytes) {
            Ok(()) => trace!("saved {}", path.display()),
            Err(e) => warn!("{}: {e}", path.display()),
        }
    }

    /// Removes the artifact files of a handle. Missing files are ignored and
    /// other failures are logged.
    pub fn remove_artifacts(&self, handle: u32) {
        for path in self.artifact_paths(handle) {
            match fs::remove_file(&path) {
                Ok(()) => trace!("removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("{}: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocktpm::MockTpm, transport::Connector};
    use tpm2_protocol::message::{TpmFlushContextCommand, TpmNvReadPublicCommand};

    #[test]
    fn test_handle_not_found_is_classified() {
        let mock = MockTpm::new();
        let mut device = TpmDevice::new(mock.connect().unwrap());
        let cmd = TpmNvReadPublicCommand {
            nv_index: 0x0100_0101u32.into(),
        };
        let err = device.execute(&cmd, &[]).unwrap_err();
        assert!(err.is_handle_not_found(), "{err}");

        let cmd = TpmFlushContextCommand {
            flush_handle: 0x8000_00FFu32.into(),
        };
        let err = device.execute(&cmd, &[]).unwrap_err();
        assert!(err.is_handle_not_found(), "{err}");
    }

    #[test]
    fn test_artifact_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTpm::new();
        let device = TpmDevice::new(mock.connect().unwrap()).with_artifact_dir(dir.path());
        assert_eq!(artifact_file_name("h", 0x8000_0001), "h80000001.bin");
        assert_eq!(artifact_file_name("hp", 0x0100_0101), "hp01000101.bin");

        device.save_artifact(ARTIFACT_CONTEXT_PREFIX, 0x8000_0001, b"name");
        device.save_artifact(ARTIFACT_PUBLIC_PREFIX, 0x8000_0001, b"public");
        assert!(device
            .artifact_paths(0x8000_0001)
            .iter()
            .all(|p| p.exists()));
        device.remove_artifacts(0x8000_0001);
        device.remove_artifacts(0x8000_0001);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
