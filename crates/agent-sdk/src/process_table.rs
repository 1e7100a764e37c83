// Process table snapshots for timeout diagnostics.

use sysinfo::{Pid, ProcessStatus, System};

/// One row of a process table snapshot.
#[derive(Debug, Clone)]
pub struct ProcessRow {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub command: String,
}

/// Snapshot every process visible to the agent, ordered by pid.
pub fn snapshot() -> Vec<ProcessRow> {
    let system = System::new_all();
    let mut rows: Vec<ProcessRow> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessRow {
            pid: pid.as_u32(),
            parent: process.parent().map(|p| p.as_u32()),
            name: process.name().to_string_lossy().to_string(),
            command: process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect();
    rows.sort_by_key(|row| row.pid);
    rows
}

/// Render the current process table as text, one process per line.
pub fn dump() -> String {
    let mut out = String::from("PID\tPPID\tNAME\tCOMMAND\n");
    for row in snapshot() {
        let parent = row.parent.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        out.push_str(&format!("{}\t{}\t{}\t{}\n", row.pid, parent, row.name, row.command));
    }
    out
}

/// [`dump`] on the blocking pool, for use from async code.
pub async fn dump_async() -> String {
    tokio::task::spawn_blocking(dump)
        .await
        .unwrap_or_else(|e| format!("process table unavailable: {e}\n"))
}

/// True if `pid` exists and is not a zombie waiting to be reaped.
pub fn is_alive(pid: u32) -> bool {
    let system = System::new_all();
    system
        .process(Pid::from_u32(pid))
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}
