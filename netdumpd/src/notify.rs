/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Post-dump notification hook.
//!
//! When a session reaches a terminal state the operator's script (if
//! configured) is invoked with `(reason, ip, hostname, infofile, corefile)`.
//! Invocation is fire-and-forget: the daemon never waits on the script's
//! outcome and its exit status is ignored; children are reaped off to the
//! side so nothing accumulates.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::error;

#[derive(Debug, Clone)]
pub struct Notifier {
    script: Option<PathBuf>,
}

impl Notifier {
    pub fn new(script: Option<PathBuf>) -> Self {
        Self { script }
    }

    pub fn notify(
        &self,
        reason: &str,
        ip: Ipv4Addr,
        hostname: &str,
        infofile: &Path,
        corefile: &Path,
    ) {
        let Some(script) = &self.script else {
            return;
        };

        let spawned = Command::new(script)
            .arg(reason)
            .arg(ip.to_string())
            .arg(hostname)
            .arg(infofile)
            .arg(corefile)
            .spawn();

        match spawned {
            Ok(mut child) => {
                let _ = tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => error!("could not run notification script {}: {e}", script.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    #[tokio::test]
    async fn script_receives_the_terminal_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" > {}\n", out.display()))
            .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let notifier = Notifier::new(Some(script));
        notifier.notify(
            "success",
            Ipv4Addr::new(10, 0, 0, 7),
            "nodeA",
            Path::new("/var/crash/info.nodeA.0"),
            Path::new("/var/crash/vmcore.nodeA.0"),
        );

        let mut args = String::new();
        for _ in 0..200 {
            args = std::fs::read_to_string(&out).unwrap_or_default();
            if !args.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            args.trim(),
            "success 10.0.0.7 nodeA /var/crash/info.nodeA.0 /var/crash/vmcore.nodeA.0"
        );
    }

    #[tokio::test]
    async fn missing_script_is_a_no_op() {
        let notifier = Notifier::new(None);
        notifier.notify(
            "timeout",
            Ipv4Addr::LOCALHOST,
            "host",
            Path::new("info"),
            Path::new("core"),
        );
    }
}
