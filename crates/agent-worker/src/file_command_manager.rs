// Ad-hoc environment file handed to each step through `CIRRUS_ENV`.
//
// Steps append `KEY=VALUE` lines (or `KEY<<DELIM` heredocs) while they run;
// the main loop consumes the file after the step and merges the result into
// the run-wide environment before the next step starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

pub struct AdHocEnvFile {
    path: TempPath,
}

impl AdHocEnvFile {
    /// Create an empty file under `directory`.
    pub fn create(directory: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(directory)?;
        let file = tempfile::Builder::new()
            .prefix("cirrus-env-")
            .tempfile_in(directory)?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_buf(&self) -> PathBuf {
        self.path.to_path_buf()
    }

    /// Read and parse the file, then delete it.
    pub fn consume(self) -> std::io::Result<HashMap<String, String>> {
        let content = std::fs::read(&self.path)?;
        let parsed = parse_env_file(&String::from_utf8_lossy(&content));
        self.path.close()?;
        Ok(parsed)
    }
}

/// Parse ad-hoc environment content.
///
/// The first `=` separates key from value, so the value may contain `=`.
/// `KEY<<DELIM` starts a multi-line value terminated by a line equal to
/// `DELIM`. Lines without a delimiter and entries with an empty key are
/// ignored.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let mut lines = content.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let heredoc = line.find("<<");
        let equals = line.find('=');
        match (heredoc, equals) {
            (Some(pos), eq) if eq.map_or(true, |eq| pos < eq) => {
                let key = line[..pos].trim();
                let delimiter = line[pos + 2..].trim();
                let mut value_lines = Vec::new();
                for value_line in lines.by_ref() {
                    if value_line == delimiter {
                        break;
                    }
                    value_lines.push(value_line);
                }
                if !key.is_empty() && !delimiter.is_empty() {
                    result.insert(key.to_string(), value_lines.join("\n"));
                }
            }
            (_, Some(pos)) => {
                let key = line[..pos].trim();
                if !key.is_empty() {
                    result.insert(key.to_string(), line[pos + 1..].to_string());
                }
            }
            _ => {}
        }
    }

    result
}
