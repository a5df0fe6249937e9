//! A token store backed by a local JSON file

use std::{io, path::PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;

use super::{StoreError, TokenRecords, TokenStore};

/// A token store that uses a local file
///
/// The file holds a JSON object keyed by backend identity. It is rewritten in
/// full on every save and is only readable by its owner on Unix platforms.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Constructs a new file token store
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The location of the backing file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_records(&self) -> Result<TokenRecords, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no token cache file yet");
                return Ok(TokenRecords::new());
            }
            Err(error) => return Err(error),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(TokenRecords::new());
        }

        let records = serde_json::from_str(&data)?;
        Ok(records)
    }

    async fn write_records(&self, records: &TokenRecords) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(records)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<TokenRecords, StoreError> {
        Ok(self.read_records().await?)
    }

    async fn save(&self, records: &TokenRecords) -> Result<(), StoreError> {
        Ok(self.write_records(records).await?)
    }
}

#[cfg(test)]
mod tests {
    use nowauth_clock::UnixTime;

    use super::*;
    use crate::{AccessToken, BackendIdentity, RefreshToken, TokenRecord};

    fn sample_records() -> TokenRecords {
        let backend = BackendIdentity::from_url("https://Dev1.service-now.com/").unwrap();
        let record = TokenRecord::new(
            backend.clone(),
            AccessToken::from_static("access"),
            Some(RefreshToken::from_static("refresh")),
            UnixTime(1_900_000_000_000),
        );
        TokenRecords::from([(backend, record)])
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saved_records_load_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested").join("tokens.json"));
        let records = sample_records();

        store.save(&records).await.unwrap();
        let loaded = FileTokenStore::new(store.path()).load().await.unwrap();

        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn file_layout_is_keyed_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        store.save(&sample_records()).await.unwrap();

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "dev1.service-now.com": {
                    "accessToken": "access",
                    "refreshToken": "refresh",
                    "expiresAt": 1_900_000_000_000u64,
                    "instanceUrl": "dev1.service-now.com",
                }
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        store.save(&sample_records()).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(FileTokenStore::new(path).load().await.is_err());
    }
}
