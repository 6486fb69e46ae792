//! Authorized public keys and the server host identity
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication)
//! Implementation: loads the authorized keys once at startup and answers
//! exact-match lookups on the canonical base64 encoding of a key.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use russh::keys::{Algorithm, PrivateKey, PublicKeyBase64};
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Immutable set of accepted public keys
///
/// NIST 800-53: AC-3 (Access Enforcement)
/// Implementation: a missing or unreadable key file leaves the store
/// unavailable, and an unavailable store rejects every key.
#[derive(Debug, Clone)]
pub struct AuthorizedKeySet {
    source: PathBuf,
    keys: Option<HashSet<String>>,
}

impl AuthorizedKeySet {
    /// Load the key file at `path`.
    ///
    /// Never fails: a file that cannot be read is reported once as a
    /// configuration error and yields a store that rejects everything.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let source = path.as_ref().to_path_buf();

        match std::fs::read_to_string(&source) {
            Ok(contents) => {
                let set = Self::from_contents(&source, &contents);
                info!(
                    event = "authorized_keys_loaded",
                    path = %source.display(),
                    keys = set.len(),
                    "Loaded authorized keys"
                );
                set
            }
            Err(e) => {
                error!(
                    event = "authorized_keys_unavailable",
                    path = %source.display(),
                    error = %e,
                    "Authorized keys file could not be read; all authentication will fail"
                );
                Self { source, keys: None }
            }
        }
    }

    /// Build a store from authorized-keys text.
    pub fn from_contents(source: impl Into<PathBuf>, contents: &str) -> Self {
        let mut keys = HashSet::new();

        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match parse_key_line(trimmed) {
                Some(canonical) => {
                    debug!("Loaded public key from line {}", index + 1);
                    keys.insert(canonical);
                }
                None => warn!(
                    event = "authorized_key_skipped",
                    line = index + 1,
                    "No decodable public key on line"
                ),
            }
        }

        Self {
            source: source.into(),
            keys: Some(keys),
        }
    }

    /// Exact membership check on the canonical base64 key encoding.
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    pub fn is_authorized(&self, candidate_key_b64: &str) -> bool {
        self.keys
            .as_ref()
            .is_some_and(|keys| keys.contains(candidate_key_b64.trim()))
    }

    /// Whether the key file was readable at load time
    pub const fn is_available(&self) -> bool {
        self.keys.is_some()
    }

    /// Number of loaded keys
    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, HashSet::len)
    }

    /// True if no key would be accepted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path the store was loaded from
    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Canonical base64 of the first decodable key blob on a line.
///
/// Accepts `<type> <base64> [comment]`, the same with leading options, or a
/// bare base64 blob.
fn parse_key_line(line: &str) -> Option<String> {
    line.split_whitespace()
        .filter_map(|token| russh::keys::parse_public_key_base64(token).ok())
        .map(|key| key.public_key_base64())
        .next()
}

/// Load the host key from `path`, or generate an Ed25519 key for this process.
///
/// NIST 800-53: SC-12 (Cryptographic Key Establishment and Management)
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or decoded,
/// and [`Error::Ssh`] if key generation fails.
pub fn load_or_generate_host_key(path: Option<&Path>) -> Result<PrivateKey> {
    if let Some(path) = path.filter(|p| p.exists()) {
        let key = russh::keys::load_secret_key(path, None).map_err(|e| {
            Error::Config(format!("Failed to load host key {}: {e}", path.display()))
        })?;
        info!(
            event = "host_key_loaded",
            path = %path.display(),
            algorithm = %key.algorithm(),
            "Loaded host key"
        );
        return Ok(key);
    }

    if let Some(path) = path {
        warn!(
            event = "host_key_missing",
            path = %path.display(),
            "Host key not found, generating a key for this process"
        );
    }

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Ssh(format!("Failed to generate host key: {e}")))?;
    info!(
        event = "host_key_generated",
        fingerprint = %key.public_key().fingerprint(Default::default()),
        "Generated ephemeral Ed25519 host key"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn random_key_b64() -> String {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .public_key_base64()
    }

    #[test]
    fn test_openssh_and_bare_lines() {
        let k1 = random_key_b64();
        let k2 = random_key_b64();
        let contents = format!("# clients\nssh-ed25519 {k1} client@drywall\n\n{k2}\n");
        let set = AuthorizedKeySet::from_contents("inline", &contents);

        assert_eq!(set.len(), 2);
        assert!(set.is_authorized(&k1));
        assert!(set.is_authorized(&k2));
    }

    #[test]
    fn test_prefix_of_listed_key_rejected() {
        let k1 = random_key_b64();
        let set = AuthorizedKeySet::from_contents("inline", &format!("ssh-ed25519 {k1}\n"));

        assert!(!set.is_authorized(&k1[..k1.len() - 4]));
        assert!(!set.is_authorized("ssh-ed25519"));
        assert!(!set.is_authorized(""));
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let k1 = random_key_b64();
        let contents = format!("not a key at all\nssh-ed25519 {k1}\n");
        let set = AuthorizedKeySet::from_contents("inline", &contents);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_missing_file_fails_closed() {
        let set = AuthorizedKeySet::load("/nonexistent/authorized_keys/client.pub");
        assert!(!set.is_available());
        assert!(set.is_empty());
        assert!(!set.is_authorized(&random_key_b64()));
    }

    #[test]
    fn test_load_from_file() {
        let k1 = random_key_b64();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ssh-ed25519 {k1} client").unwrap();

        let set = AuthorizedKeySet::load(file.path());
        assert!(set.is_available());
        assert!(set.is_authorized(&k1));
        assert_eq!(set.source(), file.path());
    }

    #[test]
    fn test_generate_host_key_without_path() {
        let key = load_or_generate_host_key(None).unwrap();
        assert_eq!(key.algorithm(), Algorithm::Ed25519);
    }

    #[test]
    fn test_unparseable_host_key_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not a private key").unwrap();

        let err = load_or_generate_host_key(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
