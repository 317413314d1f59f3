//! Failure classification for connection errors reported by the `Client`.
//!
//! The two lexicons are data, not code, so the phrase lists can be tuned
//! without touching the connection state machine.

/// Case-insensitive substrings that mark an error as terminal for the
/// `ServerId` (wrong credentials, revoked grant, ...).
pub const AUTH_PHRASES: &[&str] = &[
    "invalid grant",
    "invalid_grant",
    "unauthorized",
    "invalid credentials",
    "wrong username or password",
    "access denied",
    "authentication required",
    "invalid user",
    "bad credentials",
];

/// Case-insensitive substrings that mark an error as recoverable via retry.
/// Unclassified errors are also treated as network errors (the safer
/// default): only an explicit auth phrase is terminal.
pub const NETWORK_PHRASES: &[&str] = &[
    "timeout",
    "refused",
    "network",
    "connection reset",
    "econnreset",
    "host unreachable",
    "ehostunreach",
    "socket hang up",
    "connection closed",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Auth,
    Network,
}

/// Classifies an error message per `spec.md` §4.1: an explicit
/// `NETWORK_PHRASES` match and an unrecognized message both resolve to
/// [`FailureClass::Network`] (recoverable); only an explicit
/// `AUTH_PHRASES` match is terminal. The network lexicon is still checked
/// explicitly, rather than folded into the fallback, so a message that
/// matches neither lexicon is distinguishable from one that was actually
/// recognized as a network failure, should that distinction ever matter to
/// a caller inspecting `classify` directly.
pub fn classify(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if AUTH_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return FailureClass::Auth;
    }
    if NETWORK_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return FailureClass::Network;
    }
    FailureClass::Network
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_auth_phrases_case_insensitively() {
        assert_eq!(classify("Invalid Grant"), FailureClass::Auth);
        assert_eq!(classify("ACCESS DENIED"), FailureClass::Auth);
        assert_eq!(classify("bad credentials for user x"), FailureClass::Auth);
    }

    #[test]
    fn classifies_known_network_phrases() {
        assert_eq!(classify("ETIMEDOUT: timeout"), FailureClass::Network);
        assert_eq!(classify("ECONNREFUSED: refused"), FailureClass::Network);
        assert_eq!(classify("socket hang up"), FailureClass::Network);
    }

    #[test]
    fn unclassified_errors_default_to_network() {
        assert_eq!(classify("totally unrelated gibberish"), FailureClass::Network);
    }
}
