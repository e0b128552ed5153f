/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Per-client dump sessions: the protocol state machine, the write
//! coalescer, output-slot allocation and the session table.

mod coalescer;
mod error;
mod hostname;
mod session;
#[allow(clippy::module_inception)]
mod sessions;
pub mod spool;

pub use error::{Result, SessionError};
pub use session::{Outcome, Session};
pub use sessions::{Sessions, CLIENT_TIMEOUT, CLIENT_TPASS};
