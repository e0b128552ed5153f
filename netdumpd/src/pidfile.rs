/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! PID file management.
//!
//! The file is claimed exclusively before daemonization so a second daemon
//! refuses to start, and the PID is written afterwards so it names the
//! detached process. Dropping the guard removes the file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

const DEFAULT_PIDFILE: &str = "/var/run/netdumpd.pid";

#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("netdumpd is already running (pid file {path} exists)")]
    AlreadyRunning { path: PathBuf },
    #[error("could not create pid file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("could not write pid file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Exclusively claim the pid file, or the default location when none
    /// was requested.
    pub fn claim(path: Option<&Path>) -> Result<Self, PidFileError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_PIDFILE)).to_path_buf();
        match OpenOptions::new().write(true).create_new(true).mode(0o600).open(&path) {
            Ok(file) => Ok(Self { path, file }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(PidFileError::AlreadyRunning { path })
            }
            Err(source) => Err(PidFileError::Create { path, source }),
        }
    }

    /// Record the daemon's PID. Called after daemonization, from the child.
    pub fn write_pid(&mut self) -> Result<(), PidFileError> {
        writeln!(self.file, "{}", std::process::id())
            .and_then(|()| self.file.flush())
            .map_err(|source| PidFileError::Write { path: self.path.clone(), source })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
