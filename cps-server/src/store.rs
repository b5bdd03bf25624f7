//! File-backed operator stores.
//!
//! Each community gets its own directory under the configured store root,
//! named by the checksummed community address. The operator process owns the
//! directory contents; the server only reads the `state.json` summary the
//! operator keeps there.

use async_trait::async_trait;
use cps_core::operator::{OperatorError, OperatorStore, StoreFactory};
use cps_sdk::Address;
use cps_sdk::objects::OperatorStats;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Summary file written by the operator.
pub const STATE_FILE: &str = "state.json";

pub struct FileStoreFactory {
    root: PathBuf,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn store_for(&self, community: Address) -> Result<Box<dyn OperatorStore>, OperatorError> {
        let dir = self.root.join(community.to_checksum());
        if !tokio::fs::try_exists(&dir).await? {
            tracing::info!(community = %community, dir = %dir.display(), "Creating store directory");
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Box::new(FileStore { dir }))
    }
}

pub struct FileStore {
    dir: PathBuf,
}

#[async_trait]
impl OperatorStore for FileStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    /// Latest stats from `state.json`; zero until the operator has written it.
    async fn stats(&self) -> OperatorStats {
        let path = self.dir.join(STATE_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return OperatorStats::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read operator state");
                return OperatorStats::default();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Malformed operator state");
            OperatorStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cps_sdk::objects::MemberCount;

    #[tokio::test]
    async fn test_store_directory_is_named_by_checksum() {
        let root = tempfile::tempdir().unwrap();
        let community: Address = "0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359".parse().unwrap();

        let factory = FileStoreFactory::new(root.path());
        let store = factory.store_for(community).await.unwrap();
        let expected = root.path().join("0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
        assert!(expected.is_dir());
        assert_eq!(store.location(), expected.display().to_string());

        // Existing directories are reused.
        factory.store_for(community).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_follow_state_file() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStoreFactory::new(root.path())
            .store_for(Address::new([7; 20]))
            .await
            .unwrap();
        assert_eq!(store.stats().await, OperatorStats::default());

        let dir = root.path().join(Address::new([7; 20]).to_checksum());
        std::fs::write(dir.join(STATE_FILE), "not json").unwrap();
        assert_eq!(store.stats().await, OperatorStats::default());

        std::fs::write(
            dir.join(STATE_FILE),
            r#"{"memberCount":{"total":3,"active":2,"inactive":1},"totalEarnings":"5000"}"#,
        )
        .unwrap();
        assert_eq!(
            store.stats().await,
            OperatorStats {
                member_count: MemberCount {
                    total: 3,
                    active: 2,
                    inactive: 1,
                },
                total_earnings: "5000".to_string(),
            }
        );
    }
}
