//! Session authentication
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
//! Implementation: per-connection state machine deciding each public-key
//! offer against the shared [`AuthorizedKeySet`]. Retry limits belong to
//! the SSH transport; this module only answers accept or reject.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;

use crate::audit::AuditEvent;
use crate::keys::AuthorizedKeySet;

/// Authentication state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No attempt yet
    Unauthenticated,
    /// Last attempt was rejected; the peer may try again
    Rejected,
    /// A listed key was presented
    Authenticated {
        /// Username the peer authenticated as
        username: String,
    },
}

/// Outcome of a single authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Proceed with the session
    Accept,
    /// Refuse this attempt
    Reject,
}

/// Per-connection authenticator
#[derive(Debug)]
pub struct SessionAuthenticator {
    keys: Arc<AuthorizedKeySet>,
    peer_addr: Option<SocketAddr>,
    state: AuthState,
    attempts: u32,
}

impl SessionAuthenticator {
    /// Authenticator for a new connection from `peer_addr`
    pub const fn new(keys: Arc<AuthorizedKeySet>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            keys,
            peer_addr,
            state: AuthState::Unauthenticated,
            attempts: 0,
        }
    }

    /// Decide a public-key offer.
    ///
    /// `key_b64` is the canonical base64 encoding of the offered key.
    pub fn offer_public_key(&mut self, username: &str, key_b64: &str) -> AuthDecision {
        if !self.accepts_attempts() {
            return AuthDecision::Reject;
        }

        self.attempts += 1;
        let accepted = self.keys.is_authorized(key_b64);
        let reason = if accepted {
            None
        } else if self.keys.is_available() {
            Some("key not authorized")
        } else {
            Some("authorized keys unavailable")
        };

        self.record(username, accepted, reason);

        if accepted {
            self.state = AuthState::Authenticated {
                username: username.to_string(),
            };
            AuthDecision::Accept
        } else {
            self.state = AuthState::Rejected;
            AuthDecision::Reject
        }
    }

    /// Refuse any method other than public key.
    pub fn offer_other_method(&mut self, username: &str, method: &str) -> AuthDecision {
        if self.accepts_attempts() {
            self.attempts += 1;
            self.record(username, false, Some(method));
            self.state = AuthState::Rejected;
        }
        AuthDecision::Reject
    }

    /// Current state
    pub const fn state(&self) -> &AuthState {
        &self.state
    }

    /// True once a listed key was accepted
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated { .. })
    }

    /// Authenticated username, if any
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            AuthState::Authenticated { username } => Some(username),
            _ => None,
        }
    }

    /// Attempts decided so far
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    const fn accepts_attempts(&self) -> bool {
        !self.is_authenticated()
    }

    fn record(&self, username: &str, success: bool, reason: Option<&str>) {
        AuditEvent::AuthAttempt {
            client_ip: self.peer_addr.map(|a| a.ip()),
            username: username.to_string(),
            timestamp: Utc::now(),
            success,
            reason: reason.map(str::to_string),
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey, PublicKeyBase64};

    fn random_key_b64() -> String {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .public_key_base64()
    }

    fn authenticator(contents: &str) -> SessionAuthenticator {
        let set = AuthorizedKeySet::from_contents("inline", contents);
        SessionAuthenticator::new(Arc::new(set), Some("192.0.2.10:50022".parse().unwrap()))
    }

    #[test]
    fn test_listed_key_accepted() {
        let k1 = random_key_b64();
        let mut auth = authenticator(&format!("ssh-ed25519 {k1} client\n"));

        assert_eq!(auth.offer_public_key("drywall", &k1), AuthDecision::Accept);
        assert!(auth.is_authenticated());
        assert_eq!(auth.username(), Some("drywall"));
    }

    #[test]
    fn test_unknown_key_rejected_and_retry_allowed() {
        let k1 = random_key_b64();
        let k2 = random_key_b64();
        let mut auth = authenticator(&format!("ssh-ed25519 {k1}\n"));

        assert_eq!(auth.offer_public_key("drywall", &k2), AuthDecision::Reject);
        assert_eq!(auth.state(), &AuthState::Rejected);
        assert!(auth.username().is_none());

        assert_eq!(auth.offer_public_key("drywall", &k1), AuthDecision::Accept);
        assert_eq!(auth.attempts(), 2);
    }

    #[test]
    fn test_empty_store_rejects_all() {
        let mut auth = authenticator("");
        assert_eq!(auth.offer_public_key("drywall", &random_key_b64()), AuthDecision::Reject);
    }

    #[test]
    fn test_password_always_rejected() {
        let mut auth = authenticator("");
        assert_eq!(auth.offer_other_method("drywall", "password"), AuthDecision::Reject);
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn test_offers_after_success_are_not_decided() {
        let k1 = random_key_b64();
        let mut auth = authenticator(&format!("ssh-ed25519 {k1}\n"));
        assert_eq!(auth.offer_public_key("drywall", &k1), AuthDecision::Accept);

        assert_eq!(auth.offer_public_key("other", &random_key_b64()), AuthDecision::Reject);
        assert_eq!(auth.attempts(), 1);
        assert_eq!(auth.username(), Some("drywall"));
    }
}
