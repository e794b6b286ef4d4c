//! Helper-process invocation.
//!
//! Every backend except `dir` and `mock` drives its store through an external
//! CLI (`btrfs`, `zfs`, `lvm`, `rbd`/`ceph`). Failures of these helpers are
//! transient from this layer's point of view: the caller decides whether to
//! retry, we never do so silently beyond [`try_run_command`]'s short loop.

use std::process::Command;
use std::time::Duration;

use apollo_common::{StorageError, StorageResult};

/// How often [`try_run_command`] re-attempts a failing helper.
const TRY_ATTEMPTS: u32 = 3;

/// Pause between [`try_run_command`] attempts.
const TRY_DELAY: Duration = Duration::from_millis(500);

/// Run a helper and return its trimmed stdout.
///
/// A non-zero exit maps to [`StorageError::Transient`] carrying the helper's
/// stderr (or stdout when stderr is empty).
pub fn run_command(program: &str, args: &[&str]) -> StorageResult<String> {
    let rendered = render(program, args);
    tracing::debug!(command = %rendered, "Running helper");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| StorageError::Transient {
            command: rendered.clone(),
            message: format!("failed to spawn: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() { stdout } else { stderr };
    Err(StorageError::Transient {
        command: rendered,
        message,
    })
}

/// Run a helper, retrying a few times on failure.
///
/// Kernel-facing tools occasionally fail while a device settles; a short
/// bounded retry covers that without masking persistent errors.
pub fn try_run_command(program: &str, args: &[&str]) -> StorageResult<String> {
    let mut last = None;
    for attempt in 1..=TRY_ATTEMPTS {
        match run_command(program, args) {
            Ok(out) => return Ok(out),
            Err(err) => {
                if attempt < TRY_ATTEMPTS {
                    tracing::debug!(
                        command = %render(program, args),
                        attempt,
                        "Helper failed, retrying"
                    );
                    std::thread::sleep(TRY_DELAY);
                }
                last = Some(err);
            }
        }
    }
    Err(last.expect("at least one attempt ran"))
}

/// Run `producer | consumer`, returning the consumer's trimmed stdout.
///
/// Used for store-native transfers (`rbd export-diff | rbd import-diff`,
/// `zfs send | zfs recv`) so stream data never passes through this process.
pub fn pipe_commands(
    producer: (&str, &[&str]),
    consumer: (&str, &[&str]),
) -> StorageResult<String> {
    let rendered = format!(
        "{} | {}",
        render(producer.0, producer.1),
        render(consumer.0, consumer.1)
    );
    tracing::debug!(command = %rendered, "Running helper pipeline");

    let mut left = Command::new(producer.0)
        .args(producer.1)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| StorageError::Transient {
            command: rendered.clone(),
            message: format!("failed to spawn producer: {}", e),
        })?;

    let left_stdout = left.stdout.take().ok_or_else(|| StorageError::Transient {
        command: rendered.clone(),
        message: "producer stdout unavailable".to_string(),
    })?;

    let consumer_out = Command::new(consumer.0)
        .args(consumer.1)
        .stdin(std::process::Stdio::from(left_stdout))
        .output()
        .map_err(|e| StorageError::Transient {
            command: rendered.clone(),
            message: format!("failed to spawn consumer: {}", e),
        })?;

    let left_status = left.wait().map_err(|e| StorageError::Transient {
        command: rendered.clone(),
        message: format!("failed to wait for producer: {}", e),
    })?;

    if !left_status.success() || !consumer_out.status.success() {
        let stderr = String::from_utf8_lossy(&consumer_out.stderr).trim().to_string();
        return Err(StorageError::Transient {
            command: rendered,
            message: stderr,
        });
    }

    Ok(String::from_utf8_lossy(&consumer_out.stdout).trim().to_string())
}

fn render(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run_command("echo", &["hello", "world"]).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn nonzero_exit_is_transient() {
        let err = run_command("false", &[]).unwrap_err();
        assert!(matches!(err, StorageError::Transient { .. }));
    }

    #[test]
    fn pipeline_connects_stdout_to_stdin() {
        let out = pipe_commands(("echo", &["alpha"]), ("cat", &[])).unwrap();
        assert_eq!(out, "alpha");
    }

    #[test]
    fn missing_binary_is_transient() {
        let err = run_command("apollo-no-such-helper", &[]).unwrap_err();
        match err {
            StorageError::Transient { message, .. } => {
                assert!(message.contains("failed to spawn"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
