// The run-wide environment: task variables plus the sensitive-value set.
//
// Shared between the main loop and every active log streamer. Writes only
// happen on the main loop between steps; readers take short read locks.

use crate::secret_masker::SecretMasker;
use agent_sdk::StringUtil;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Prefix of a value that must be resolved by the secret resolver.
pub const BOXED_VALUE_PREFIX: &str = "VAULT[";

/// Whether `value` uses the boxed secret syntax `VAULT[...]`.
pub fn is_boxed_value(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with(BOXED_VALUE_PREFIX) && trimmed.ends_with(']')
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: Arc<RwLock<HashMap<String, String>>>,
    masker: SecretMasker,
}

impl Environment {
    pub fn new(masker: SecretMasker) -> Self {
        Self {
            vars: Arc::new(RwLock::new(HashMap::new())),
            masker,
        }
    }

    pub fn from_map(vars: HashMap<String, String>, masker: SecretMasker) -> Self {
        Self {
            vars: Arc::new(RwLock::new(vars)),
            masker,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.write().insert(key.into(), value.into());
    }

    /// Set `key` and register its value for redaction.
    pub fn set_sensitive(&self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        self.masker.add_value(&value);
        self.vars.write().insert(key.into(), value);
    }

    pub fn add_sensitive_value(&self, value: &str) {
        self.masker.add_value(value);
    }

    /// Merge `other` over the current variables.
    pub fn merge(&self, other: &HashMap<String, String>) {
        let mut vars = self.vars.write();
        for (key, value) in other {
            vars.insert(key.clone(), value.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.vars.read().clone()
    }

    /// A copy where every value has been expanded against the others.
    pub fn expanded(&self) -> HashMap<String, String> {
        let vars = self.snapshot();
        vars.iter()
            .map(|(k, v)| (k.clone(), StringUtil::expand_text_fully(v, &vars)))
            .collect()
    }

    /// `true` when `key` is set to a truthy value (`true`, `1`, `yes`).
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false)
    }

    pub fn masker(&self) -> &SecretMasker {
        &self.masker
    }

    pub fn mask(&self, data: &[u8]) -> Vec<u8> {
        self.masker.mask_bytes(data)
    }
}

/// Phase one of staging: expand each custom value first against the
/// process environment, then against the custom map itself.
pub fn stage_custom_environment(
    process_env: &HashMap<String, String>,
    custom: &HashMap<String, String>,
) -> HashMap<String, String> {
    custom
        .iter()
        .map(|(key, value)| {
            let against_process = StringUtil::expand_text(value, process_env);
            let against_custom = StringUtil::expand_text_fully(&against_process, custom);
            (key.clone(), against_custom)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_boxed_syntax() {
        assert!(is_boxed_value("VAULT[secret/data/ci token]"));
        assert!(is_boxed_value("  VAULT[path] "));
        assert!(!is_boxed_value("VAULT path"));
        assert!(!is_boxed_value("plain"));
    }

    #[test]
    fn test_set_sensitive_registers_mask() {
        let env = Environment::default();
        env.set_sensitive("TOKEN", "s3cr3t");
        assert_eq!(env.get("TOKEN").as_deref(), Some("s3cr3t"));
        assert_eq!(env.mask(b"token=s3cr3t"), b"token=HIDDEN-BY-CI-AGENT".to_vec());
    }

    #[test]
    fn test_clones_share_state() {
        let env = Environment::default();
        let reader = env.clone();
        env.merge(&map(&[("A", "1")]));
        env.add_sensitive_value("late-secret");
        assert_eq!(reader.get("A").as_deref(), Some("1"));
        assert_eq!(reader.masker().secret_count(), 1);
    }

    #[test]
    fn test_expanded_resolves_references() {
        let env = Environment::from_map(
            map(&[("BASE", "/opt"), ("BIN", "${BASE}/bin"), ("PATHISH", "$BIN:x")]),
            SecretMasker::new(),
        );
        let expanded = env.expanded();
        assert_eq!(expanded["PATHISH"], "/opt/bin:x");
        // the stored values are untouched
        assert_eq!(env.get("BIN").as_deref(), Some("${BASE}/bin"));
    }

    #[test]
    fn test_stage_prefers_process_values_then_custom() {
        let process = map(&[("HOME", "/home/ci")]);
        let custom = map(&[
            ("CACHE", "${HOME}/.cache"),
            ("NAME", "agent"),
            ("GREETING", "hello ${NAME}"),
        ]);
        let staged = stage_custom_environment(&process, &custom);
        assert_eq!(staged["CACHE"], "/home/ci/.cache");
        assert_eq!(staged["GREETING"], "hello agent");
    }

    #[test]
    fn test_is_enabled() {
        let env = Environment::from_map(map(&[("FLAG", "true"), ("OFF", "0")]), SecretMasker::new());
        assert!(env.is_enabled("FLAG"));
        assert!(!env.is_enabled("OFF"));
        assert!(!env.is_enabled("MISSING"));
    }
}
