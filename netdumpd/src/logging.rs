/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Daemon logging.
//!
//! In debug mode (`-D`) everything goes to the terminal. Otherwise the
//! daemon logs to syslog under the `daemon` facility, with a terminal
//! logger alongside for the messages emitted before daemonization detaches
//! the tty.

use log::{Level, SetLoggerError};
use simplelog::SimpleLogger;
use syslog::{BasicLogger, Facility, Formatter3164};
use thiserror::Error;

const NETDUMPD_SYSLOG_NAME: &str = "netdumpd";

#[derive(Error, Debug)]
pub(crate) enum LoggingError {
    #[error("unable to connect to syslog: {0}")]
    SysLogConnectionFailure(syslog::Error),
    #[error("unable to install logger: {0}")]
    SetupFailure(SetLoggerError),
}

pub(crate) fn init(debug: bool) -> Result<(), LoggingError> {
    if debug {
        init_terminal_logging(Level::Debug)
    } else {
        init_syslog_logging(Level::Info)
    }
}

fn init_syslog_logging(logger_level: Level) -> Result<(), LoggingError> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: NETDUMPD_SYSLOG_NAME.into(),
        pid: 0,
    };

    let logger_simple = create_logger_simple(logger_level);
    let logger_syslog =
        syslog::unix(formatter).map_err(LoggingError::SysLogConnectionFailure)?;

    multi_log::MultiLogger::init(
        vec![logger_simple, Box::new(BasicLogger::new(logger_syslog))],
        logger_level,
    )
    .map_err(LoggingError::SetupFailure)
}

fn init_terminal_logging(logger_level: Level) -> Result<(), LoggingError> {
    multi_log::MultiLogger::init(
        vec![create_logger_simple(logger_level)],
        logger_level,
    )
    .map_err(LoggingError::SetupFailure)
}

fn create_logger_simple(logger_level: Level) -> Box<SimpleLogger> {
    SimpleLogger::new(
        logger_level.to_level_filter(),
        simplelog::Config::default(),
    )
}
