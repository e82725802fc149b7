use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::info;

/// Asynchronously relays the output from a child process's `stdout` and `stderr` to the tracing log.
/// Each line is logged as soon as it is read, with lossy UTF-8 conversion.
///
/// Callers attach the tool identity through the enclosing span.
pub(crate) async fn relay_process_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
    tokio::join!(relay_lines(stdout, "stdout"), relay_lines(stderr, "stderr"));
}

async fn relay_lines<R>(stream: Option<R>, fd: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                info!(fd, "{}", line.trim_end_matches(['\n', '\r']));
            }
        }
    }
}
