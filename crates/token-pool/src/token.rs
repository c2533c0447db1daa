//! Opaque upstream credential

use std::fmt;

use sha2::{Digest, Sha256};

/// An upstream credential token.
///
/// Compared and hashed by value. Debug and Display print a fingerprint so the
/// secret never reaches logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CredentialToken(String);

impl CredentialToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token, for building the upstream Authorization header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars of the SHA-256 digest.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialToken({})", self.fingerprint())
    }
}

impl fmt::Display for CredentialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}
