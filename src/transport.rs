// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{config::TpmTarget, error::TpmDeviceError, tpm::TPM_HEADER_SIZE};
use log::debug;
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};
use tpm2_protocol::TPM_MAX_COMMAND_SIZE;

/// A trait for a transport layer capable of sending and receiving full TPM commands.
pub trait Transport: Send + std::fmt::Debug {
    /// Sends a complete command buffer to the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` on I/O failure.
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError>;

    /// Receives a complete response buffer from the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` on I/O failure or if the response is malformed.
    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError>;
}

/// Opens fresh transports. Each session connects once and drops the
/// transport when it closes.
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` if the TPM cannot be reached.
    fn connect(&self) -> Result<Box<dyn Transport>, TpmDeviceError>;
}

impl Connector for TpmTarget {
    fn connect(&self) -> Result<Box<dyn Transport>, TpmDeviceError> {
        match self {
            TpmTarget::Device(path) => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                debug!("opened {}", path.display());
                Ok(Box::new(FileTransport(file)))
            }
            TpmTarget::Socket(path) => {
                let stream = UnixStream::connect(path)?;
                debug!("connected to {}", path.display());
                Ok(Box::new(StreamTransport(stream)))
            }
        }
    }
}

/// Reads one response frame, using the header size field for framing.
fn receive_frame(reader: &mut impl Read) -> Result<Vec<u8>, TpmDeviceError> {
    let mut header = [0u8; TPM_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < header.len() {
        return Err(TpmDeviceError::ResponseUnderflow);
    }
    if size > TPM_MAX_COMMAND_SIZE {
        return Err(TpmDeviceError::ResponseOverflow);
    }

    let mut resp_buf = header.to_vec();
    resp_buf.resize(size, 0);
    reader.read_exact(&mut resp_buf[header.len()..])?;
    Ok(resp_buf)
}

fn send_frame(writer: &mut impl Write, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
    writer.write_all(command_bytes)?;
    writer.flush()?;
    Ok(())
}

/// A transport implementation that wraps a `std::fs::File`.
#[derive(Debug)]
pub struct FileTransport(pub File);

impl Transport for FileTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
        send_frame(&mut self.0, command_bytes)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError> {
        receive_frame(&mut self.0)
    }
}

/// A transport over a unix domain socket, e.g. served by `mock-tpm`.
#[derive(Debug)]
pub struct StreamTransport(pub UnixStream);

impl Transport for StreamTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
        send_frame(&mut self.0, command_bytes)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError> {
        receive_frame(&mut self.0)
    }
}

#[derive(Debug, Default)]
pub struct EndpointState {
    pub buffer: VecDeque<u8>,
    pub writer_dropped: bool,
}

#[derive(Debug, Default)]
pub struct EndpointGuard {
    pub state: Mutex<EndpointState>,
    pub cvar: Condvar,
}

impl EndpointGuard {
    fn lock(&self) -> io::Result<MutexGuard<'_, EndpointState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("pipe state poisoned"))
    }
}

#[derive(Debug)]
pub struct Endpoint(pub Arc<EndpointGuard>);

/// An in-memory pipe transport for testing and simulation.
#[derive(Debug)]
pub struct PipeTransport(pub Endpoint, pub Endpoint);

impl PipeTransport {
    /// Creates a connected pair of pipe ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let from_server = Arc::new(EndpointGuard::default());
        let from_client = Arc::new(EndpointGuard::default());

        let server = PipeTransport(Endpoint(from_client.clone()), Endpoint(from_server.clone()));
        let client = PipeTransport(Endpoint(from_server), Endpoint(from_client));
        (server, client)
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.0.lock()?;
        while !state.writer_dropped && state.buffer.is_empty() {
            state = self
                .0
                .cvar
                .wait(state)
                .map_err(|_| io::Error::other("pipe state poisoned"))?;
        }

        if state.writer_dropped && state.buffer.is_empty() {
            return Ok(0);
        }

        let bytes_to_read = buf.len().min(state.buffer.len());
        for (i, byte) in state.buffer.drain(..bytes_to_read).enumerate() {
            buf[i] = byte;
        }
        Ok(bytes_to_read)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.0.lock()?;
        if state.writer_dropped {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader dropped",
            ));
        }
        state.buffer.extend(buf);
        self.0.cvar.notify_one();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.writer_dropped = true;
        }
        self.0.cvar.notify_all();
    }
}

impl Read for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.1.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.1.flush()
    }
}

impl Transport for PipeTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
        send_frame(self, command_bytes)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError> {
        receive_frame(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pipe_frames() {
        let (mut server, mut client) = PipeTransport::pair();
        let echo = thread::spawn(move || {
            let frame = receive_frame(&mut server).unwrap();
            send_frame(&mut server, &frame).unwrap();
        });

        let frame = [0x80, 0x01, 0, 0, 0, 12, 0, 0, 0, 0, 0xAB, 0xCD];
        client.send(&frame).unwrap();
        assert_eq!(client.receive().unwrap(), frame.to_vec());
        echo.join().unwrap();
    }

    #[test]
    fn test_pipe_rejects_short_size() {
        let (mut server, mut client) = PipeTransport::pair();
        server
            .write_all(&[0x80, 0x01, 0, 0, 0, 4, 0, 0, 0, 0])
            .unwrap();
        assert!(matches!(
            client.receive(),
            Err(TpmDeviceError::ResponseUnderflow)
        ));
    }

    #[test]
    fn test_pipe_closed_peer() {
        let (server, mut client) = PipeTransport::pair();
        drop(server);
        assert!(matches!(client.receive(), Err(TpmDeviceError::Io(_))));
    }
}
