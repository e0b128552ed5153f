/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Kernel crash dump server daemon.
//!
//! A panicking kernel has no filesystem and no TCP: it streams its memory
//! image as fixed-size UDP datagrams and expects a prompt acknowledgement
//! for each. `netdumpd` tracks many such clients concurrently from a single
//! thread, spools every dump as an `info.<host>.<n>` / `vmcore.<host>.<n>`
//! file pair, and guarantees that every byte it acknowledges at the end of
//! a dump is durably captured.
// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hickory_resolver::TokioAsyncResolver;
use nix::unistd::AccessFlags;
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::pidfile::PidFile;
use crate::protocol::NETDUMP_PORT;
use crate::server::{herald, DumpServer, ServerContext};
use crate::sessions::spool::SpoolDir;

mod logging;
pub mod notify;
mod pidfile;
pub mod protocol;
pub mod server;
pub mod sessions;

/// Default dump spool directory.
const DEFAULT_DUMPDIR: &str = "/var/crash";

/// Default exit code for successful termination of netdumpd.
const EXIT_OKAY: i32 = 0;

/// Default exit code for a bootstrap or runtime error of netdumpd.
const EXIT_ERROR: i32 = 1;

/// Command line options for netdumpd.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct NetdumpdOptions {
    /// Address to bind the listening socket to. Defaults to all interfaces.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: Ipv4Addr,
    /// Directory dumps are spooled to.
    #[arg(short = 'd', long, default_value = DEFAULT_DUMPDIR)]
    dumpdir: PathBuf,
    /// Executable notified when a dump ends. Invoked with
    /// (reason, ip, hostname, infofile, corefile).
    #[arg(short = 'i', long)]
    script: Option<PathBuf>,
    /// PID file location. Defaults to /var/run/netdumpd.pid.
    #[arg(short = 'P', long)]
    pidfile: Option<PathBuf>,
    /// Stay in the foreground and log to the terminal instead of syslog.
    #[arg(short = 'D', long)]
    debug: bool,
}

/// This is the core function of the netdumpd runtime.
pub fn daemon() -> i32 {
    let options = NetdumpdOptions::parse();

    if let Err(e) = logging::init(options.debug) {
        eprintln!("netdumpd: {e}");
        return EXIT_ERROR;
    }

    info!("starting netdump server, pid {}", std::process::id());

    match bootstrap(options) {
        Ok(()) => EXIT_OKAY,
        Err(e) => {
            error!("{e:#}");
            EXIT_ERROR
        }
    }
}

/// Bring up every long-lived resource, detach, and hand control to the
/// event loop. The PID file is released on every exit path.
fn bootstrap(options: NetdumpdOptions) -> anyhow::Result<()> {
    let mut pidfile = PidFile::claim(options.pidfile.as_deref())?;

    // Pinned to an absolute path: daemon(2) will chdir to / and the
    // notification hook is handed locations under this directory.
    let dumpdir = options
        .dumpdir
        .canonicalize()
        .with_context(|| format!("invalid dump location {}", options.dumpdir.display()))?;
    let meta = std::fs::metadata(&dumpdir)
        .with_context(|| format!("invalid dump location {}", dumpdir.display()))?;
    anyhow::ensure!(meta.is_dir(), "dump location {} is not a directory", dumpdir.display());
    if nix::unistd::access(dumpdir.as_path(), AccessFlags::W_OK).is_err() {
        warn!("may be unable to write into dump location {}", dumpdir.display());
    }
    if options.dumpdir.as_os_str() == DEFAULT_DUMPDIR {
        info!("default: dumping to {DEFAULT_DUMPDIR}");
    } else {
        info!("dumping to {}", dumpdir.display());
    }
    let spool = SpoolDir::open(&dumpdir)
        .with_context(|| format!("could not open dump location {}", dumpdir.display()))?;

    let notifier = match &options.script {
        Some(script) => {
            nix::unistd::access(script.as_path(), AccessFlags::F_OK | AccessFlags::X_OK)
                .with_context(|| {
                    format!("cannot access notification script {}", script.display())
                })?;
            // daemon(2) changes directory to /; a relative script path must
            // be pinned down before that.
            let script = script.canonicalize().with_context(|| {
                format!("cannot resolve notification script {}", script.display())
            })?;
            Notifier::new(Some(script))
        }
        None => Notifier::new(None),
    };

    if options.address == Ipv4Addr::UNSPECIFIED {
        warn!("default: listening on all interfaces");
    } else {
        info!("listening on IP {}", options.address);
    }
    let listener = herald::bind_listener(options.address, NETDUMP_PORT)
        .with_context(|| format!("could not bind {}:{NETDUMP_PORT}", options.address))?;

    if !options.debug {
        nix::unistd::daemon(false, false).context("could not daemonize")?;
    }
    pidfile.write_pid()?;

    // The whole protocol runs on one thread, and the reactor must be
    // created after daemon(2) forks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not build the runtime")?;

    runtime.block_on(async {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                warn!("reverse DNS unavailable ({e}), falling back to numeric hostnames");
                None
            }
        };

        let ctx = ServerContext { spool, notifier, resolver, port: NETDUMP_PORT };
        let mut server = DumpServer::new(listener, ctx)?;
        server.run().await
    })?;

    drop(pidfile);
    Ok(())
}
