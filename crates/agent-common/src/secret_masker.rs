// SecretMasker: the run-wide set of sensitive values and their redaction.
//
// The set only grows during a run. Masking is an exact-substring replace of
// every known value with a fixed placeholder; longer values win when one
// secret is a substring of another.

use parking_lot::RwLock;
use regex::bytes::Regex;
use std::sync::Arc;

/// Replacement text used when a sensitive value is found.
pub const MASK: &str = "HIDDEN-BY-CI-AGENT";

/// A thread-safe, append-only secret masker.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<SecretMaskerInner>>,
}

#[derive(Debug, Default)]
struct SecretMaskerInner {
    /// Registered values, longest first.
    secrets: Vec<String>,
    /// Alternation over `secrets`, rebuilt whenever the set grows.
    pattern: Option<Regex>,
    min_secret_length: usize,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensitive value. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        if secret.trim().is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        if inner.secrets.iter().any(|s| s == secret) {
            return;
        }
        inner.secrets.push(secret.to_string());
        inner.secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        inner.min_secret_length = inner.secrets.iter().map(|s| s.len()).min().unwrap_or(0);

        let alternation = inner
            .secrets
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        match Regex::new(&alternation) {
            Ok(pattern) => inner.pattern = Some(pattern),
            Err(e) => tracing::warn!("Failed to compile secret pattern: {}", e),
        }
    }

    /// Register every value in `secrets`.
    pub fn add_values<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for secret in secrets {
            self.add_value(secret.as_ref());
        }
    }

    /// Replace every registered value in `input` with [`MASK`].
    pub fn mask_bytes(&self, input: &[u8]) -> Vec<u8> {
        let inner = self.inner.read();
        match &inner.pattern {
            Some(pattern) if input.len() >= inner.min_secret_length => {
                pattern.replace_all(input, MASK.as_bytes()).into_owned()
            }
            _ => input.to_vec(),
        }
    }

    /// String flavour of [`SecretMasker::mask_bytes`].
    pub fn mask_secrets(&self, input: &str) -> String {
        let masked = self.mask_bytes(input.as_bytes());
        String::from_utf8(masked)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }

    pub fn secret_count(&self) -> usize {
        self.inner.read().secrets.len()
    }
}
