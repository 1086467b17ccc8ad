use std::{path::Path, process::Stdio, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::SourceError;

/// Spawns `command`, retrying briefly while the executable is still busy
/// (freshly written scripts can report ETXTBSY).
pub(crate) async fn spawn_with_retry(
    command: &mut Command,
    program: &Path,
) -> Result<Child, SourceError> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(SourceError::Spawn {
                    program: program.to_path_buf(),
                    source,
                });
            }
        }
    }
}

/// Lists running container names with `<program> ps --format {{.Names}}`.
pub(crate) async fn discover_containers(program: &Path) -> Result<Vec<String>, SourceError> {
    let mut command = Command::new(program);
    command
        .args(["ps", "--format", "{{.Names}}"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = spawn_with_retry(&mut command, program).await?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|source| SourceError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(SourceError::Discover {
            program: program.to_path_buf(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }

    let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    debug!(count = names.len(), "discovered running containers");

    if names.is_empty() {
        return Err(SourceError::NoContainers);
    }
    Ok(names)
}
