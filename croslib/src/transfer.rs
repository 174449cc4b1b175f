use std::{
    io,
    path::Path,
};

use log::{debug, trace};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
};

use crate::{
    progress::ProgressListener,
    transport::{Body, Resume, Transport, TransportError},
};

/// Size of the partial file at `path`, or 0 if there is none.
async fn partial_size(path: &Path) -> io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Download `url` into `path`, continuing from whatever a previous attempt
/// left in the file. Returns the final size of the file. The data is durably
/// written before this returns, but the file is never renamed; callers move
/// it into place once they've decided it is complete.
pub(crate) async fn download_resumable<T, L>(
    transport: &T,
    url: &str,
    path: &Path,
    listener: &mut L,
) -> Result<u64, TransportError>
where
    T: Transport,
    L: ProgressListener,
{
    let offset = partial_size(path).await?;

    let (mut body, append) = match transport.fetch_from(url, offset).await? {
        Resume::Complete => {
            debug!("Partial file is already complete: {:?}", path);
            listener.transfer_resumed(offset);
            return Ok(offset);
        }
        Resume::Append(body) => {
            if offset > 0 {
                debug!("Resuming {:?} at offset {}", path, offset);
                listener.transfer_resumed(offset);
            }
            (body, true)
        }
        Resume::Restart(body) => {
            if offset > 0 {
                debug!("Server does not support resuming; restarting {:?}", path);
            }
            (body, false)
        }
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await?;
    let mut size = if append { offset } else { 0 };

    while let Some(data) = body.next_chunk().await? {
        trace!("Received {} bytes for {:?}", data.len(), path);

        file.write_all(&data).await?;
        size += data.len() as u64;
        listener.bytes_received(data.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;

    if size == 0 {
        return Err(TransportError::EmptyBody);
    }

    Ok(size)
}
