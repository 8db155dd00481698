use std::io::Cursor;
use std::time::SystemTime;

use bytes::Bytes;
use drive_api::{DriveClient, DriveError, HttpClient};
use drive_api::models::FileInfo;

use super::{ObjectReader, RemoteEntry, RemoteError, RemoteStore};

/// [`RemoteStore`] backed by the drive HTTP API.
///
/// Reads buffer the whole object because the API has no range requests; the returned reader
/// then serves it from memory.
#[derive(Debug)]
pub struct DriveStore<C: HttpClient> {
    client: DriveClient<C>,
}

impl<C: HttpClient> DriveStore<C> {
    /// Wrap a configured client.
    #[must_use]
    pub fn new(client: DriveClient<C>) -> Self {
        Self { client }
    }
}

impl<C: HttpClient + 'static> RemoteStore for DriveStore<C> {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let files = self.client.list(path).await.map_err(into_remote)?;
        Ok(files.into_iter().map(into_entry).collect())
    }

    async fn read(&self, path: &str) -> Result<ObjectReader, RemoteError> {
        let body = self.client.read(path).await.map_err(into_remote)?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn write_whole(&self, path: &str, body: Bytes) -> Result<(), RemoteError> {
        self.client.write(path, body).await.map_err(into_remote)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.client.delete(path).await.map_err(into_remote)
    }

    async fn make_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.client.make_directory(path).await.map_err(into_remote)
    }
}

fn into_entry(file: FileInfo) -> RemoteEntry {
    RemoteEntry {
        name: file.name,
        is_dir: file.is_dir,
        size: if file.is_dir { 0 } else { file.size },
        modified_at: file.modified.map_or(SystemTime::UNIX_EPOCH, SystemTime::from),
    }
}

fn into_remote(err: DriveError) -> RemoteError {
    match err {
        DriveError::NotFound { path } => RemoteError::NotFound { path },
        DriveError::Status { status, body } | DriveError::Auth { status, body } => {
            RemoteError::Status {
                status: status.as_u16(),
                message: body,
            }
        }
        other @ (DriveError::Http(_)
        | DriveError::Decode(_)
        | DriveError::InvalidBaseUrl { .. }) => RemoteError::Transport(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use drive_api::HttpClientError;

    use super::*;

    fn info(name: &str, size: u64, is_dir: bool) -> FileInfo {
        FileInfo {
            name: name.to_owned(),
            size,
            is_dir,
            modified: None,
            path: format!("/{name}"),
        }
    }

    #[test]
    fn listing_entries_map_onto_remote_entries() {
        let file = into_entry(info("a.txt", 12, false));
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.size, 12);
        assert!(!file.is_dir);
        assert_eq!(file.modified_at, SystemTime::UNIX_EPOCH);

        // Folders never report a size, whatever the drive says.
        let dir = into_entry(info("docs", 4096, true));
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn missing_objects_stay_distinguishable() {
        let err = into_remote(DriveError::NotFound {
            path: "/gone".to_owned(),
        });
        assert!(matches!(err, RemoteError::NotFound { ref path } if path == "/gone"));
    }

    #[test]
    fn transport_failures_are_wrapped() {
        let err = into_remote(DriveError::Http(HttpClientError::Timeout));
        assert!(matches!(err, RemoteError::Transport(_)));
    }
}
