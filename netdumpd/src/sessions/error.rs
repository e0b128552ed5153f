/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use std::io;
use std::net::Ipv4Addr;

use super::spool::SpoolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not create reply socket for {ip}: {source}")]
    Socket { ip: Ipv4Addr, source: io::Error },
    #[error("could not reserve output files for {host} [{ip}]: {source}")]
    Output { host: String, ip: Ipv4Addr, source: SpoolError },
}
