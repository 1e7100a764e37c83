// Process-tree containment strategies.
//
// A script's descendants (including ones it backgrounds) must be killable
// as a unit. POSIX hosts start the child as the leader of a new process
// group and signal the group; Windows hosts start it in a new process group
// and terminate the tree with `taskkill /T`.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::process::Command;

/// How a launched process and its descendants are grouped and terminated.
#[async_trait]
pub trait ProcessGroupStrategy: Send + Sync + Debug {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Configure `command` before it is spawned.
    fn prepare(&self, command: &mut Command);

    /// Forcibly terminate every process in the tree rooted at `pid`.
    ///
    /// Terminating a tree that is already gone is not an error.
    async fn kill_tree(&self, pid: u32) -> std::io::Result<()>;
}

/// The strategy for the host the agent runs on.
pub fn platform_default() -> Arc<dyn ProcessGroupStrategy> {
    if cfg!(windows) {
        Arc::new(WindowsProcessTree)
    } else {
        Arc::new(PosixProcessGroup)
    }
}

/// Session leader + `killpg(SIGKILL)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixProcessGroup;

#[async_trait]
impl ProcessGroupStrategy for PosixProcessGroup {
    fn name(&self) -> &'static str {
        "posix-process-group"
    }

    fn prepare(&self, command: &mut Command) {
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        #[cfg(not(unix))]
        {
            let _ = command;
        }
    }

    async fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(std::io::Error::from(e)),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "process groups are only available on POSIX hosts",
            ))
        }
    }
}

/// New process group + `taskkill /T /F`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProcessTree;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[async_trait]
impl ProcessGroupStrategy for WindowsProcessTree {
    fn name(&self) -> &'static str {
        "windows-process-tree"
    }

    fn prepare(&self, command: &mut Command) {
        #[cfg(windows)]
        {
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }
        #[cfg(not(windows))]
        {
            let _ = command;
        }
    }

    async fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        let output = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output()
            .await?;
        // 128: the process tree is already gone.
        match output.status.code() {
            Some(0) | Some(128) => Ok(()),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "taskkill failed for pid {pid}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
        }
    }
}
