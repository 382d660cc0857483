// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use clap::Parser;
use log::{error, info, warn};
use std::{
    io,
    os::unix::{fs::PermissionsExt, net::UnixListener},
    path::{Path, PathBuf},
};
use tpm2_u2f::{config::SOCKET_PREFIX, mocktpm::MockTpm};

const SOCKET_NAME: &str = "mock-tpm.sock";

/// Serves a reference TPM over a unix domain socket.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory for the socket
    #[arg(long, default_value = "/tmp/tpm2-u2f")]
    cache_path: PathBuf,
}

fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e);
        }
    }
    let listener = UnixListener::bind(path)?;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
        warn!("{}: {e}", path.display());
    }
    Ok(listener)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args = Args::parse();

    if let Err(e) = std::fs::create_dir_all(&args.cache_path) {
        error!("{}: {e}", args.cache_path.display());
        std::process::exit(1);
    }

    let path = args.cache_path.join(SOCKET_NAME);
    let listener = match bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}: {e}", path.display());
            std::process::exit(1);
        }
    };

    info!("Listening on {SOCKET_PREFIX}{}", path.display());

    let tpm = MockTpm::new();
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Accepted connection");
                tpm.serve(stream);
                info!("Client disconnected");
            }
            Err(e) => {
                error!("Accepting connection failed: {e}");
            }
        }
    }
}
