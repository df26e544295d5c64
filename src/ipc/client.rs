//! IPC client for sending commands to the daemon.

use crate::error::{Result, VoiceError};
use crate::ipc::protocol::{Command, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

async fn open(socket_path: &Path, command: &Command) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream =
        UnixStream::connect(socket_path)
            .await
            .map_err(|e| VoiceError::IpcConnection {
                message: format!("Failed to connect to daemon: {}", e),
            })?;

    let (reader, mut writer) = stream.into_split();

    let mut command_json = command.to_json().map_err(|e| VoiceError::IpcProtocol {
        message: format!("Failed to serialize command: {}", e),
    })?;
    command_json.push('\n');

    writer
        .write_all(command_json.as_bytes())
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to write command: {}", e),
        })?;

    writer
        .flush()
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })?;

    Ok((BufReader::new(reader), writer))
}

fn parse(line: &str) -> Result<Response> {
    Response::from_json(line.trim()).map_err(|e| VoiceError::IpcProtocol {
        message: format!("Failed to deserialize response: {}", e),
    })
}

/// Send a command to the daemon via Unix socket.
///
/// # Errors
/// Returns `VoiceError::IpcConnection` if connection fails
/// Returns `VoiceError::IpcProtocol` if serialization/deserialization fails
pub async fn send_command(socket_path: &Path, command: Command) -> Result<Response> {
    let (mut reader, _writer) = open(socket_path, &command).await?;

    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to read response: {}", e),
        })?;

    parse(&response_line)
}

/// Stream conversation entries after `since`.
///
/// Calls `on_response` for every line the daemon sends until the daemon
/// closes the stream or `on_response` returns `false`.
pub async fn follow<F>(socket_path: &Path, since: u64, mut on_response: F) -> Result<()>
where
    F: FnMut(Response) -> bool,
{
    let (reader, _writer) = open(socket_path, &Command::Follow { since }).await?;
    let mut lines = reader.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to read event: {}", e),
        })?
    {
        if !on_response(parse(&line)?) {
            break;
        }
    }
    Ok(())
}
