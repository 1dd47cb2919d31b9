//! One client connection: request in, reply out, repeat

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{AppError, Result};
use crate::protocol::{Command, Dispatcher, RECORD_SIZE};

/// Receive one record
///
/// Issues a single read, which keeps it cancel-safe inside `select!`.
/// `Ok(None)` means the peer closed; a short read is a protocol error.
pub async fn read_record<S>(stream: &mut S) -> Result<Option<Command>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; RECORD_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let cmd = Command::from_bytes(&buf[..n])?;
    trace!("Received {:?}", cmd);
    Ok(Some(cmd))
}

/// Send one record
pub async fn write_record<S>(stream: &mut S, cmd: &Command) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&cmd.to_bytes())
        .await
        .map_err(|e| AppError::Protocol(format!("send failed: {}", e)))?;
    stream.flush().await?;
    Ok(())
}

/// Serve requests until the peer closes (`Ok`) or breaks the protocol (`Err`)
pub async fn serve_connection<S>(stream: &mut S, dispatcher: &Dispatcher) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(cmd) = read_record(stream).await? {
        let reply = dispatcher.handle(cmd).await;
        write_record(stream, &reply).await?;
    }
    Ok(())
}
