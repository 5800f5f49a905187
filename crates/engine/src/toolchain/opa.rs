use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::{BuildRequest, ExplainRequest, Toolchain, ToolchainError, ToolchainVersion};
use crate::config::EngineConfig;

/// Standard error is only used for diagnostics; cap it at 1 MB.
const MAX_STDERR_BYTES: usize = 1024 * 1024;

/// `opa build` and `opa version` print very little to stdout.
const MAX_SMALL_STDOUT_BYTES: usize = 1024 * 1024;

/// The `opa` command-line tool.
#[derive(Debug, Clone)]
pub struct OpaCli {
    binary: PathBuf,
    build_timeout: Duration,
    eval_timeout: Duration,
    version_timeout: Duration,
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl OpaCli {
    /// Use the binary and timeouts from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            binary: config.opa_binary.clone(),
            build_timeout: config.build_timeout(),
            eval_timeout: config.eval_timeout(),
            version_timeout: config.version_timeout(),
        }
    }

    /// Run `opa <subcommand> <args>` to completion under `timeout`.
    ///
    /// The child is killed if the timeout fires. Standard output beyond
    /// `max_stdout` is not buffered and fails the call.
    async fn run(
        &self,
        subcommand: &'static str,
        args: Vec<OsString>,
        timeout: Duration,
        max_stdout: usize,
    ) -> Result<Captured, ToolchainError> {
        debug!(binary = %self.binary.display(), subcommand, "spawning toolchain");

        let mut child = match Command::new(&self.binary)
            .arg(subcommand)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolchainError::NotInstalled(
                    self.binary.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolchainError::InvalidOutput("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolchainError::InvalidOutput("stderr was not captured".into()))?;

        let collect = async {
            let (out, err, status) = tokio::join!(
                read_capped(stdout, max_stdout),
                read_capped(stderr, MAX_STDERR_BYTES),
                child.wait()
            );
            Ok::<_, std::io::Error>((out?, err?, status?))
        };

        let ((stdout, overflowed), (stderr, _), status) =
            tokio::time::timeout(timeout, collect)
                .await
                .map_err(|_| ToolchainError::Timeout {
                    subcommand,
                    timeout,
                })??;

        if overflowed {
            return Err(ToolchainError::OutputTooLarge {
                subcommand,
                limit: max_stdout,
            });
        }

        debug!(subcommand, status = %status, stdout_bytes = stdout.len(), "toolchain finished");
        Ok(Captured {
            status,
            stdout,
            stderr,
        })
    }
}

impl Captured {
    fn into_failure(self, subcommand: &'static str) -> ToolchainError {
        ToolchainError::Failed {
            subcommand,
            status: self.status.to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_owned(),
            stdout: String::from_utf8_lossy(&self.stdout).trim().to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl Toolchain for OpaCli {
    async fn version(&self) -> Result<ToolchainVersion, ToolchainError> {
        let out = self
            .run("version", Vec::new(), self.version_timeout, MAX_SMALL_STDOUT_BYTES)
            .await?;
        if !out.status.success() {
            return Err(out.into_failure("version"));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        ToolchainVersion::from_version_output(&text).ok_or_else(|| {
            ToolchainError::InvalidOutput(format!(
                "no 'Version: X.Y.Z' line in `opa version` output: {}",
                text.trim()
            ))
        })
    }

    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), ToolchainError> {
        let mut args: Vec<OsString> = vec![
            "-t".into(),
            "wasm".into(),
            "-o".into(),
            request.output.as_os_str().to_owned(),
        ];
        for entrypoint in request.entrypoints {
            args.push("-e".into());
            args.push(entrypoint.into());
        }
        args.push(request.source.as_os_str().to_owned());

        let out = self
            .run("build", args, self.build_timeout, MAX_SMALL_STDOUT_BYTES)
            .await?;
        if !out.status.success() {
            return Err(out.into_failure("build"));
        }
        Ok(())
    }

    async fn eval_explain(
        &self,
        request: &ExplainRequest<'_>,
    ) -> Result<serde_json::Value, ToolchainError> {
        let args: Vec<OsString> = vec![
            "--format".into(),
            "json".into(),
            "--explain".into(),
            request.mode.as_arg().into(),
            "--data".into(),
            request.source.as_os_str().to_owned(),
            "--input".into(),
            request.input.as_os_str().to_owned(),
            request.query.into(),
        ];

        let out = self
            .run("eval", args, self.eval_timeout, request.max_output_bytes)
            .await?;
        if !out.status.success() {
            return Err(out.into_failure("eval"));
        }
        serde_json::from_slice(&out.stdout).map_err(|e| {
            ToolchainError::InvalidOutput(format!("`opa eval` did not print JSON: {e}"))
        })
    }
}

/// Read at most `limit` bytes, reporting whether more were available.
async fn read_capped<R>(reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(cap).read_to_end(&mut buf).await?;
    let overflowed = buf.len() > limit;
    buf.truncate(limit);
    Ok((buf, overflowed))
}
