//! Bidirectional byte pump between a caller's streams and a subprocess.
//!
//! [`pump`] wires a subprocess's stdin/stdout/stderr to three caller-supplied
//! streams and runs all three copies concurrently.  The call returns only
//! after both output copies have drained and the subprocess has been reaped,
//! so a caller that sees `Ok(())` has received every byte the subprocess
//! wrote.

use std::io;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Failure modes of a single [`pump`] call.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} was started without a piped {stream}")]
    MissingPipe {
        program: String,
        stream: &'static str,
    },
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited unsuccessfully ({status})")]
    Exit { program: String, status: ExitStatus },
}

/// Run `cmd`, feeding it `stdin` and copying its output into `stdout` and
/// `stderr`.
///
/// The stdin copy is not awaited on its own: a client may hold its side open
/// long after the subprocess is done with it, so it is abandoned once both
/// output copies finish.  Its errors are ignored.  Errors on the output
/// copies are logged but do not fail the call; the exit status decides.
/// An output whose writer fails keeps being read and discarded so the child
/// never blocks on a full pipe.
pub async fn pump<R, W, E>(
    mut cmd: Command,
    mut stdin: R,
    mut stdout: W,
    mut stderr: E,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    // All three pipes exist before the child runs; nothing it writes can be
    // lost to a late reader.
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| PumpError::Spawn {
        program: program.clone(),
        source,
    })?;

    let missing = |stream| PumpError::MissingPipe {
        program: program.clone(),
        stream,
    };
    let mut child_stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let mut child_stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let mut child_stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let (out, err) = {
        let feed = async {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                debug!(error = %e, "stdin copy ended with error");
            }
            // Closing the pipe is the subprocess's EOF.
            let _ = child_stdin.shutdown().await;
            drop(child_stdin);
        };

        let drains = async {
            tokio::join!(
                drain(&mut child_stdout, &mut stdout),
                drain(&mut child_stderr, &mut stderr),
            )
        };

        tokio::pin!(feed);
        tokio::pin!(drains);

        let mut feeding = true;
        loop {
            tokio::select! {
                drained = &mut drains => break drained,
                () = &mut feed, if feeding => feeding = false,
            }
        }
        // An unfinished stdin copy is dropped here, closing the child's stdin.
    };

    if let Err(e) = out {
        debug!(error = %e, %program, "stdout copy ended with error");
    }
    if let Err(e) = err {
        debug!(error = %e, %program, "stderr copy ended with error");
    }
    drop(child_stdout);
    drop(child_stderr);

    let status = child.wait().await.map_err(|source| PumpError::Wait {
        program: program.clone(),
        source,
    })?;

    if !status.success() {
        return Err(PumpError::Exit { program, status });
    }

    debug!(%program, "subprocess finished");
    Ok(())
}

/// Copy `reader` into `writer`.  If the copy fails, the rest of `reader` is
/// read into [`tokio::io::sink`] before the error is returned.
async fn drain<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(reader, writer).await {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = tokio::io::copy(reader, &mut tokio::io::sink()).await;
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
