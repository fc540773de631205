//! Parallel execution of external encoder processes.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::pipe::PipeReader;
use crate::error::{Error, Result};

/// One external encoder invocation, optionally fed from a pipe reader.
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<PipeReader>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, reader: PipeReader) -> Self {
        self.stdin = Some(reader);
        self
    }
}

/// Runs all commands in parallel and waits for every one of them to exit.
/// Returns the first failure, if any. A failing child's captured output is
/// dumped to the host's streams; the dump lock keeps dumps from different
/// children from interleaving.
pub async fn run_all(commands: Vec<EncoderCommand>, verbose: bool) -> Result<()> {
    let dump_lock = Arc::new(Mutex::new(()));

    let children: Vec<_> = commands
        .into_iter()
        .map(|command| {
            let dump_lock = dump_lock.clone();
            tokio::spawn(run_one(command, verbose, dump_lock))
        })
        .collect();

    let mut first_error = None;
    for child in children {
        let result = child
            .await
            .map_err(|e| Error::Encoder(format!("executor task failed: {e}")))?;
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_one(
    command: EncoderCommand,
    verbose: bool,
    dump_lock: Arc<Mutex<()>>,
) -> Result<()> {
    debug!(program = %command.program, args = ?command.args, "spawning");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Encoder(format!("spawn {}: {e}", command.program)))?;

    let feeder = command.stdin.map(|reader| {
        let stdin = child.stdin.take().expect("stdin was requested piped");
        tokio::spawn(feed_stdin(reader, stdin))
    });

    let stdout = capture(child.stdout.take().expect("stdout piped"), verbose, false);
    let stderr = capture(child.stderr.take().expect("stderr piped"), verbose, true);

    // Drain the output pipes while waiting, or a chatty child would block
    // on a full pipe and never exit.
    let (status, out, err) = tokio::join!(child.wait(), stdout, stderr);
    let status =
        status.map_err(|e| Error::Encoder(format!("wait {}: {e}", command.program)))?;
    if let Some(feeder) = feeder {
        let _ = feeder.await;
    }

    if status.success() {
        return Ok(());
    }

    {
        let _guard = dump_lock.lock().unwrap();
        eprintln!("--- {} {} ---", command.program, status);
        eprint!("{}", String::from_utf8_lossy(&out));
        eprint!("{}", String::from_utf8_lossy(&err));
    }

    Err(Error::Encoder(format!(
        "{} exited with {status}",
        command.program
    )))
}

/// Streams pipe chunks into the child's stdin, then closes it so the child
/// observes end-of-stream. A write failure means the child went away; that
/// is the child's story to tell via its exit status.
async fn feed_stdin(mut reader: PipeReader, mut stdin: tokio::process::ChildStdin) {
    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = stdin.write_all(&chunk).await {
                    warn!(error = %e, "stdin feed stopped");
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn capture(
    mut source: impl AsyncRead + Unpin + Send + 'static,
    verbose: bool,
    is_stderr: bool,
) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if verbose {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    if is_stderr {
                        eprint!("{text}");
                    } else {
                        print!("{text}");
                    }
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }
    buffer
}
