use interprocess::local_socket::{
    tokio::Stream as TokioStream, traits::tokio::Stream as _, GenericFilePath, ToFsName as _,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::address::Address;
use crate::constants::{MAX_FRAME_LEN, SOCKET_PATH};
use crate::error::{Error, Result};
use crate::gateway::{GatewaySnapshot, ScanResult};

/// Commands the CLI sends to the daemon, one per connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Status,
    Scan,
    ScanResults,
    Start { address: Address },
    Stop { address: Address },
    Read { address: Address },
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Status(GatewaySnapshot),
    ScanResults(Vec<ScanResult>),
    Error(String),
}

/// Writes `message` as a little endian u32 length followed by its JSON body
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "frame of {} bytes exceeds {MAX_FRAME_LEN}",
            body.len()
        )));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0; 4];
    reader.read_exact(&mut len).await?;

    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "announced frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;

    Ok(serde_json::from_slice(&body)?)
}

pub async fn connect() -> Result<TokioStream> {
    let fs_name = SOCKET_PATH
        .to_fs_name::<GenericFilePath>()
        .map_err(|error| Error::Ipc(format!("invalid socket path {SOCKET_PATH}: {error}")))?;

    TokioStream::connect(fs_name).await.map_err(|error| {
        Error::Ipc(format!(
            "cannot connect to {SOCKET_PATH} ({error}), is the daemon running ?"
        ))
    })
}

/// Sends one request to the daemon and waits for its answer
pub async fn send_request(request: &Request) -> Result<Response> {
    let mut stream = connect().await?;
    write_frame(&mut stream, request).await?;

    read_frame(&mut stream).await
}
