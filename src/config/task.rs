//! Pre-launch / post-debug task execution.
//!
//! Tasks are spawned from an argv array; user-provided strings never pass
//! through a shell. A `npm:` prefix dispatches to the package script runner.

use crate::debugger::error::Error;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Hard ceiling for a gating task; the child is killed on expiry.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(120);

/// Split a command line into argv, honoring single/double quotes and
/// backslash escapes. No expansion of any kind happens.
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                c => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c => current.push(c),
            },
        }
    }
    if in_word {
        argv.push(current);
    }
    argv
}

fn task_argv(task: &str) -> Result<Vec<String>, Error> {
    let argv = match task.strip_prefix("npm:") {
        Some(script) => vec!["npm".to_string(), "run".to_string(), script.trim().to_string()],
        None => split_command_line(task),
    };
    if argv.is_empty() || argv[0].is_empty() {
        return Err(Error::ConfigParse(format!("empty task command: `{task}`")));
    }
    Ok(argv)
}

/// Run a gating task to completion. Stdout lines are streamed through
/// `on_output`; stderr is captured for the failure report.
pub async fn run_task(
    task: &str,
    cwd: &Path,
    limit: Duration,
    mut on_output: impl FnMut(&str),
) -> Result<(), Error> {
    let argv = task_argv(task)?;
    log::info!("running task `{task}` in {}", cwd.display());

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::PreLaunchFailed {
            exit_code: -1,
            stderr: format!("failed to spawn `{}`: {e}", argv[0]),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stderr_buf = String::new();

    let outcome = tokio::time::timeout(limit, async {
        let stream_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_output(&line);
                }
            }
        };
        let capture_stderr = async {
            if let Some(stderr) = stderr {
                let _ = BufReader::new(stderr).read_to_string(&mut stderr_buf).await;
            }
        };
        let (status, _, _) = tokio::join!(child.wait(), stream_stdout, capture_stderr);
        status
    })
    .await;

    match outcome {
        Err(_) => {
            log::warn!("task `{task}` exceeded {limit:?}, killing");
            let _ = child.kill().await;
            Err(Error::PreLaunchFailed {
                exit_code: -1,
                stderr: format!("task timed out after {}s", limit.as_secs()),
            })
        }
        Ok(Err(e)) => Err(Error::PreLaunchFailed {
            exit_code: -1,
            stderr: format!("task wait failed: {e}"),
        }),
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(Error::PreLaunchFailed {
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr_buf.trim().to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splitter_honors_quotes() {
        assert_eq!(
            split_command_line(r#"make all CFLAGS="-O2 -g""#),
            ["make", "all", "CFLAGS=-O2 -g"]
        );
        assert_eq!(
            split_command_line(r#"echo 'single quoted "inner"' done"#),
            ["echo", r#"single quoted "inner""#, "done"]
        );
        assert_eq!(split_command_line(r"a\ b c"), ["a b", "c"]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn npm_prefix_dispatches_to_script_runner() {
        assert_eq!(task_argv("npm: build").unwrap(), ["npm", "run", "build"]);
    }

    #[tokio::test]
    async fn failing_task_reports_exit_code() {
        let err = run_task("sh -c exit\\ 2", Path::new("/tmp"), TASK_TIMEOUT, |_| {})
            .await
            .unwrap_err();
        match err {
            Error::PreLaunchFailed { exit_code, .. } => assert_eq!(exit_code, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stdout_is_streamed() {
        let mut lines = Vec::new();
        run_task("echo hello", Path::new("/tmp"), TASK_TIMEOUT, |line| {
            lines.push(line.to_string());
        })
        .await
        .unwrap();
        assert_eq!(lines, ["hello"]);
    }

    #[tokio::test]
    async fn overrunning_task_is_killed() {
        let err = run_task(
            "sleep 30",
            Path::new("/tmp"),
            Duration::from_millis(200),
            |_| {},
        )
        .await
        .unwrap_err();
        match err {
            Error::PreLaunchFailed { exit_code, stderr } => {
                assert_eq!(exit_code, -1);
                assert!(stderr.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn no_shell_interpolation_happens() {
        // A shell would expand the subcommand; argv spawning must not.
        let mut lines = Vec::new();
        run_task("echo $(id)", Path::new("/tmp"), TASK_TIMEOUT, |line| {
            lines.push(line.to_string());
        })
        .await
        .unwrap();
        assert_eq!(lines, ["$(id)"]);
    }
}
