// Script materialization: picks an interpreter and renders a temporary
// script file with fail-fast semantics for a batch of script lines.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;

use crate::process_launcher::ProcessError;
use crate::string_util::StringUtil;

/// Value of the shell override that bypasses the script file entirely.
pub const DIRECT_SHELL: &str = "direct";

/// Fallback POSIX shell when `bash` is not on the PATH.
const POSIX_FALLBACK_SHELL: &str = "/bin/sh";

/// Target platform for script rendering. Selected at construction so both
/// flavours can be exercised from one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPlatform {
    Posix,
    Windows,
}

impl ScriptPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            ScriptPlatform::Windows
        } else {
            ScriptPlatform::Posix
        }
    }
}

/// The interpreter family a script is rendered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    /// `sh`, `bash`, `zsh`... on a POSIX host.
    Posix { shell: String },
    /// `cmd.exe`.
    WindowsCmd { shell: String },
    /// `powershell.exe` / `pwsh.exe`.
    PowerShell { shell: String },
    /// A bash build on Windows (Git Bash, MSYS2, WSL bash).
    WindowsBash { shell: String },
    /// Execute the single expanded line as an argv, no script file.
    Direct,
}

impl Interpreter {
    fn script_extension(&self) -> &'static str {
        match self {
            Interpreter::WindowsCmd { .. } => ".bat",
            Interpreter::PowerShell { .. } => ".ps1",
            _ => ".sh",
        }
    }
}

/// A ready-to-spawn command line. Holding `script_file` keeps the temporary
/// script alive; dropping it deletes the file.
#[derive(Debug)]
pub struct ShellInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub script_file: Option<TempPath>,
}

/// Renders script batches into temporary files.
#[derive(Debug, Clone)]
pub struct ShellScriptBuilder {
    platform: ScriptPlatform,
    shell_override: Option<String>,
    posix_default_shell: String,
}

impl ShellScriptBuilder {
    /// Builder for the current host, preferring `bash` when it is installed.
    pub fn for_current_platform() -> Self {
        let posix_default_shell = which::which("bash")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| POSIX_FALLBACK_SHELL.to_string());
        Self {
            platform: ScriptPlatform::current(),
            shell_override: None,
            posix_default_shell,
        }
    }

    pub fn new(platform: ScriptPlatform, posix_default_shell: impl Into<String>) -> Self {
        Self {
            platform,
            shell_override: None,
            posix_default_shell: posix_default_shell.into(),
        }
    }

    /// An explicit interpreter always wins over the platform default.
    pub fn with_shell_override(mut self, shell: Option<String>) -> Self {
        self.shell_override = shell.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn select_interpreter(&self) -> Interpreter {
        match self.platform {
            ScriptPlatform::Posix => match &self.shell_override {
                Some(shell) if shell == DIRECT_SHELL => Interpreter::Direct,
                Some(shell) => Interpreter::Posix {
                    shell: shell.clone(),
                },
                None => Interpreter::Posix {
                    shell: self.posix_default_shell.clone(),
                },
            },
            ScriptPlatform::Windows => {
                let shell = match &self.shell_override {
                    Some(shell) if shell == DIRECT_SHELL => return Interpreter::Direct,
                    Some(shell) => shell.clone(),
                    None => "cmd.exe".to_string(),
                };
                let file_name = Path::new(&shell.replace('\\', "/"))
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if file_name.starts_with("powershell") || file_name.starts_with("pwsh") {
                    Interpreter::PowerShell { shell }
                } else if file_name.starts_with("bash") {
                    Interpreter::WindowsBash { shell }
                } else {
                    Interpreter::WindowsCmd { shell }
                }
            }
        }
    }

    /// Render the script text for `interpreter`: fail-fast preamble, the
    /// lines themselves, and per-platform error forwarding.
    pub fn render(&self, interpreter: &Interpreter, lines: &[String]) -> String {
        let mut script = String::new();
        match interpreter {
            Interpreter::Posix { shell } => {
                script.push_str(&format!("#!{shell}\n\n"));
                script.push_str("set -e\n");
                if shell.ends_with("bash") {
                    script.push_str("set -o pipefail\n");
                }
                script.push_str("set -o verbose\n");
                for line in lines {
                    script.push_str(line);
                    script.push('\n');
                }
            }
            Interpreter::WindowsBash { .. } => {
                script.push_str("set -e\nset -o pipefail\nset -o verbose\n");
                for line in lines {
                    script.push_str(line);
                    script.push('\n');
                }
            }
            Interpreter::WindowsCmd { .. } => {
                script.push_str("@echo on\r\n");
                for line in lines {
                    script.push_str(&format!("call {line}\r\n"));
                    script.push_str("if %errorlevel% neq 0 exit /b %errorlevel%\r\n");
                }
            }
            Interpreter::PowerShell { .. } => {
                script.push_str("$ErrorActionPreference = 'Stop'\r\n");
                script.push_str("$ProgressPreference = 'SilentlyContinue'\r\n");
                for line in lines {
                    script.push_str(&format!("{line}\r\n"));
                    script.push_str(
                        "if ((Test-Path -LiteralPath variable:\\LASTEXITCODE) -and ($LASTEXITCODE -ne 0)) { exit $LASTEXITCODE }\r\n",
                    );
                }
            }
            Interpreter::Direct => {}
        }
        script
    }

    /// Produce the command line for `lines`, writing a script file into
    /// `temp_dir` unless the interpreter is [`Interpreter::Direct`].
    pub fn materialize(
        &self,
        lines: &[String],
        env: &HashMap<String, String>,
        temp_dir: &Path,
    ) -> Result<ShellInvocation, ProcessError> {
        let interpreter = self.select_interpreter();
        if interpreter == Interpreter::Direct {
            return direct_invocation(lines, env);
        }

        let content = self.render(&interpreter, lines);
        let script_path = write_script_file(temp_dir, interpreter.script_extension(), &content)?;
        let script_arg = script_path.to_string_lossy().to_string();

        let (program, args) = match interpreter {
            Interpreter::WindowsCmd { shell } => (
                shell,
                vec!["/d".into(), "/s".into(), "/c".into(), script_arg],
            ),
            Interpreter::PowerShell { shell } => (
                shell,
                vec![
                    "-NoLogo".into(),
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-ExecutionPolicy".into(),
                    "Bypass".into(),
                    "-File".into(),
                    script_arg,
                ],
            ),
            Interpreter::Posix { shell } | Interpreter::WindowsBash { shell } => {
                (shell, vec![script_arg])
            }
            Interpreter::Direct => (String::new(), Vec::new()),
        };

        Ok(ShellInvocation {
            program,
            args,
            script_file: Some(script_path),
        })
    }
}

/// Direct mode: the single line is expanded against the staged environment
/// and executed as an argv.
fn direct_invocation(
    lines: &[String],
    env: &HashMap<String, String>,
) -> Result<ShellInvocation, ProcessError> {
    if lines.len() != 1 {
        return Err(ProcessError::Launch(format!(
            "direct shell mode requires exactly one script line, got {}",
            lines.len()
        )));
    }
    let expanded = StringUtil::expand_text_fully(&lines[0], env);
    let mut argv = shell_split(&expanded).into_iter();
    let program = argv
        .next()
        .ok_or_else(|| ProcessError::Launch("direct shell mode got an empty command".into()))?;
    Ok(ShellInvocation {
        program,
        args: argv.collect(),
        script_file: None,
    })
}

fn write_script_file(temp_dir: &Path, extension: &str, content: &str) -> Result<TempPath, ProcessError> {
    std::fs::create_dir_all(temp_dir)
        .map_err(|e| ProcessError::Launch(format!("failed to create '{}': {e}", temp_dir.display())))?;

    let mut file = tempfile::Builder::new()
        .prefix("scripts")
        .suffix(extension)
        .tempfile_in(temp_dir)
        .map_err(|e| ProcessError::Launch(format!("failed to create script file: {e}")))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| ProcessError::Launch(format!("failed to write script file: {e}")))?;

    // Closing the handle matters on Windows, where an open file cannot be executed.
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
    }

    Ok(path)
}

/// Split a command line into argv. Splits on whitespace but respects double
/// and single quotes and backslash escapes outside single quotes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if !in_single_quote => {
                escape_next = true;
                in_token = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                in_token = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                in_token = true;
            }
            ' ' | '\t' | '\n' if !in_single_quote && !in_double_quote => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if in_token {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn shell_split_handles_quotes() {
        assert_eq!(shell_split("hello world"), vec!["hello", "world"]);
        assert_eq!(
            shell_split(r#"echo "world foo" 'a b' c\ d"#),
            vec!["echo", "world foo", "a b", "c d"]
        );
        assert_eq!(shell_split(r#"printf """#), vec!["printf", ""]);
        assert!(shell_split("   ").is_empty());
    }

    #[test]
    fn override_wins_over_default() {
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/bash")
            .with_shell_override(Some("/bin/zsh".into()));
        assert_eq!(
            builder.select_interpreter(),
            Interpreter::Posix {
                shell: "/bin/zsh".into()
            }
        );
    }

    #[test]
    fn empty_override_is_ignored() {
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh")
            .with_shell_override(Some("  ".into()));
        assert_eq!(
            builder.select_interpreter(),
            Interpreter::Posix {
                shell: "/bin/sh".into()
            }
        );
    }

    #[test]
    fn windows_selection_by_file_name() {
        let select = |shell: Option<&str>| {
            ShellScriptBuilder::new(ScriptPlatform::Windows, "unused")
                .with_shell_override(shell.map(String::from))
                .select_interpreter()
        };
        assert!(matches!(select(None), Interpreter::WindowsCmd { .. }));
        assert!(matches!(
            select(Some(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe")),
            Interpreter::PowerShell { .. }
        ));
        assert!(matches!(select(Some("pwsh")), Interpreter::PowerShell { .. }));
        assert!(matches!(
            select(Some(r"C:\Program Files\Git\bin\bash.exe")),
            Interpreter::WindowsBash { .. }
        ));
        assert_eq!(select(Some("direct")), Interpreter::Direct);
    }

    #[test]
    fn bash_preamble_enables_pipefail() {
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/usr/bin/bash");
        let script = builder.render(&builder.select_interpreter(), &lines(&["echo hi"]));
        assert!(script.starts_with("#!/usr/bin/bash\n"));
        assert!(script.contains("set -e\n"));
        assert!(script.contains("set -o pipefail\n"));
        assert!(script.contains("set -o verbose\n"));
        assert!(script.ends_with("echo hi\n"));
    }

    #[test]
    fn plain_sh_has_no_pipefail() {
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh");
        let script = builder.render(&builder.select_interpreter(), &lines(&["true"]));
        assert!(!script.contains("pipefail"));
    }

    #[test]
    fn cmd_forwards_error_level_after_each_line() {
        let builder = ShellScriptBuilder::new(ScriptPlatform::Windows, "unused");
        let script = builder.render(&builder.select_interpreter(), &lines(&["dir", "ver"]));
        assert_eq!(script.matches("exit /b %errorlevel%").count(), 2);
        assert!(script.contains("call dir\r\n"));
    }

    #[test]
    fn materialize_writes_script_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh");
        let invocation = builder
            .materialize(&lines(&["echo one", "echo two"]), &HashMap::new(), dir.path())
            .unwrap();
        assert_eq!(invocation.program, "/bin/sh");
        let path = invocation.script_file.as_ref().unwrap().to_path_buf();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("echo one\necho two\n"));
        assert_eq!(invocation.args, vec![path.to_string_lossy().to_string()]);

        drop(invocation);
        assert!(!path.exists());
    }

    #[test]
    fn direct_mode_expands_and_splits() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<String, String> =
            [("TARGET".to_string(), "world wide".to_string())].into_iter().collect();
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh")
            .with_shell_override(Some(DIRECT_SHELL.into()));
        let invocation = builder
            .materialize(&lines(&["echo \"$TARGET\" done"]), &env, dir.path())
            .unwrap();
        assert_eq!(invocation.program, "echo");
        assert_eq!(invocation.args, vec!["world wide", "done"]);
        assert!(invocation.script_file.is_none());
    }

    #[test]
    fn direct_mode_rejects_multiple_lines() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh")
            .with_shell_override(Some(DIRECT_SHELL.into()));
        let err = builder
            .materialize(&lines(&["true", "false"]), &HashMap::new(), dir.path())
            .unwrap_err();
        assert!(matches!(err, ProcessError::Launch(_)));
    }
}
