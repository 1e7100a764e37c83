use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Matches `${NAME}`, `$NAME` and `%NAME%` references.
static VARIABLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|%([A-Za-z_][A-Za-z0-9_]*)%")
        .expect("variable reference pattern is valid")
});

/// Upper bound on nested expansion passes; guards against self-referencing values.
const MAX_EXPANSION_PASSES: usize = 10;

/// String helpers used when preparing commands and environments.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Replace characters that are invalid in file names with `_`.
    pub fn format_into_safe_filename(name: &str) -> String {
        let invalid_chars: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', ' '];
        name.chars()
            .map(|ch| {
                if invalid_chars.contains(&ch) || (ch as u32) < 0x20 {
                    '_'
                } else {
                    ch
                }
            })
            .collect()
    }

    /// Perform a single expansion pass of `$NAME`, `${NAME}` and `%NAME%`
    /// against `lookup`. Unknown references are left untouched.
    pub fn expand_text(text: &str, lookup: &HashMap<String, String>) -> String {
        if !text.contains('$') && !text.contains('%') {
            return text.to_string();
        }

        VARIABLE_REFERENCE
            .replace_all(text, |caps: &Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match lookup.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Expand repeatedly until the text stops changing, so that values which
    /// themselves reference other variables are fully resolved.
    pub fn expand_text_fully(text: &str, lookup: &HashMap<String, String>) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let next = Self::expand_text(&current, lookup);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}
