/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Reverse resolution of client addresses to short host names.
//!
//! Dump artifacts are named after the client. A PTR record gives the
//! friendly name with the domain suffix stripped; anything else falls back
//! to the dotted quad. Resolution failure is never fatal.

use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::TokioAsyncResolver;
use tracing::warn;

pub async fn resolve_short(resolver: Option<&TokioAsyncResolver>, ip: Ipv4Addr) -> String {
    let Some(resolver) = resolver else {
        return ip.to_string();
    };

    match resolver.reverse_lookup(IpAddr::V4(ip)).await {
        Ok(lookup) => {
            if let Some(name) = lookup.iter().next() {
                let name = name.to_utf8();
                let short = name.trim_end_matches('.').split('.').next().unwrap_or("");
                if usable_label(short) {
                    return short.to_string();
                }
                warn!("ignoring unusable PTR name '{name}' for {ip}");
            }
            ip.to_string()
        }
        Err(e) => {
            warn!("reverse lookup for {ip} failed: {e}");
            ip.to_string()
        }
    }
}

/// The resolved label ends up in spool file names; reject anything that
/// could not be a single path component.
fn usable_label(label: &str) -> bool {
    !label.is_empty()
        && label != "."
        && label != ".."
        && !label.contains(['/', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_resolver_falls_back_to_dotted_quad() {
        let name = resolve_short(None, Ipv4Addr::new(10, 0, 0, 7)).await;
        assert_eq!(name, "10.0.0.7");
    }

    #[test]
    fn label_sanity() {
        assert!(usable_label("nodea"));
        assert!(usable_label("node-a_1"));
        assert!(!usable_label(""));
        assert!(!usable_label(".."));
        assert!(!usable_label("evil/../path"));
    }
}
