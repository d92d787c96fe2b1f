//! Fixed backend catalog (spec §3): five well-known local OpenAI-compatible
//! servers, plus a port blacklist the scanner must never touch.
//!
//! No teacher analog — the teacher binds one model in-process. Grounded on
//! the shape `web/routes/hub.rs` assumes for a remote OpenAI-ish API (a
//! base url plus a bearer token), generalized into an immutable catalog.

use crate::types::Backend;

/// Bearer token every well-known backend and the scanner itself accepts
/// without question — these servers run on loopback only and the token
/// exists to satisfy clients that always send an `Authorization` header.
pub const FIXED_BEARER_TOKEN: &str = "afm-local";

pub const KNOWN_BACKENDS: &[Backend] = &[
    Backend {
        name: "Ollama",
        hostname: "127.0.0.1",
        port: 11434,
    },
    Backend {
        name: "LM Studio",
        hostname: "127.0.0.1",
        port: 1234,
    },
    Backend {
        name: "llama.cpp",
        hostname: "127.0.0.1",
        port: 8080,
    },
    Backend {
        name: "vLLM",
        hostname: "127.0.0.1",
        port: 8000,
    },
    Backend {
        name: "text-generation-webui",
        hostname: "127.0.0.1",
        port: 5000,
    },
];

/// Ports the scanner must never probe even if they fall inside a scanned
/// range — internal-use-only services a stray connection attempt
/// shouldn't disturb.
pub const PORT_BLACKLIST: &[u16] = &[
    22, 25, 53, 111, 123, 135, 139, 445, 631, 3306, 5432, 6379, 27017,
];

/// The ≈1,100-port scan space (spec §4.5 phase 2): a band of common local
/// dev-server ports plus the ports Ollama/LM Studio/llama.cpp-style tools
/// commonly bind to, excluding anything in `PORT_BLACKLIST`.
pub fn scan_ranges() -> Vec<std::ops::RangeInclusive<u16>> {
    vec![3000..=3099, 5000..=5099, 7000..=7099, 8000..=8999]
}

pub fn scan_ports(self_port: u16) -> impl Iterator<Item = u16> {
    let known: Vec<u16> = KNOWN_BACKENDS.iter().map(|b| b.port).collect();
    scan_ranges().into_iter().flatten().filter(move |port| {
        *port != self_port && !known.contains(port) && !PORT_BLACKLIST.contains(port)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_ports_excludes_self_known_and_blacklist() {
        let ports: Vec<u16> = scan_ports(8080).collect();
        assert!(!ports.contains(&8080));
        assert!(!ports.contains(&11434));
        assert!(!ports.contains(&5432));
    }

    #[test]
    fn known_backends_have_distinct_ports() {
        let mut ports: Vec<u16> = KNOWN_BACKENDS.iter().map(|b| b.port).collect();
        let len_before = ports.len();
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), len_before);
    }
}
