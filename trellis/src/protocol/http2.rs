use super::ProbeResult;

/// RFC 7540 connection preface sent by clients before any frame.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub fn probe(prefix: &[u8]) -> ProbeResult {
    if prefix.len() >= CLIENT_PREFACE.len() {
        if prefix.starts_with(CLIENT_PREFACE) {
            ProbeResult::Matched
        } else {
            ProbeResult::Failed
        }
    } else if CLIENT_PREFACE.starts_with(prefix) {
        ProbeResult::Again
    } else {
        ProbeResult::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_prefix_needs_more() {
        assert_eq!(probe(b"PRI * "), ProbeResult::Again);
        assert_eq!(probe(CLIENT_PREFACE), ProbeResult::Matched);
        assert_eq!(probe(b"PRX"), ProbeResult::Failed);
    }
}
