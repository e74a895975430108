pub mod bolt;
pub mod http2;

use std::fmt;

/// The closed set of wire protocols. The registry keeps the set pluggable at
/// startup; nothing outside this enum is dispatched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolName {
    Bolt,
    Http2,
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolName::Bolt => write!(f, "bolt"),
            ProtocolName::Http2 => write!(f, "http2"),
        }
    }
}

/// Result of probing the first bytes of a connection against one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Matched,
    /// Not enough bytes to decide yet.
    Again,
    Failed,
}

/// Result of server-side auto-detection across all registered protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matched(ProtocolName),
    Again,
    Failed,
}

type ProbeFn = fn(&[u8]) -> ProbeResult;

/// Name-keyed protocol registry. Registered once at runtime construction;
/// the proxy consults it with the first bytes of every downstream connection.
pub struct ProtocolRegistry {
    probes: Vec<(ProtocolName, ProbeFn)>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry { probes: Vec::new() }
    }

    /// Registry with both built-in protocols.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProtocolName::Bolt, bolt::probe);
        registry.register(ProtocolName::Http2, http2::probe);
        registry
    }

    pub fn register(&mut self, name: ProtocolName, probe: ProbeFn) {
        self.probes.push((name, probe));
    }

    /// First protocol that matches wins. If none matches but at least one
    /// needs more bytes, the caller keeps buffering.
    pub fn match_protocol(&self, prefix: &[u8]) -> MatchResult {
        let mut again = false;
        for (name, probe) in &self.probes {
            match probe(prefix) {
                ProbeResult::Matched => return MatchResult::Matched(*name),
                ProbeResult::Again => again = true,
                ProbeResult::Failed => {}
            }
        }
        if again {
            MatchResult::Again
        } else {
            MatchResult::Failed
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_detect_bolt() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(
            registry.match_protocol(&[bolt::PROTOCOL_CODE_V1, 1]),
            MatchResult::Matched(ProtocolName::Bolt)
        );
    }

    #[test]
    fn auto_detect_http2_preface() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(
            registry.match_protocol(http2::CLIENT_PREFACE),
            MatchResult::Matched(ProtocolName::Http2)
        );
        // A strict prefix of the preface is not decidable yet.
        assert_eq!(
            registry.match_protocol(&http2::CLIENT_PREFACE[..4]),
            MatchResult::Again
        );
    }

    #[test]
    fn garbage_fails() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(registry.match_protocol(b"GET / HTTP/1.1"), MatchResult::Failed);
    }

    #[test]
    fn zero_bytes_is_again() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(registry.match_protocol(b""), MatchResult::Again);
    }
}
