pub mod analyze;
pub mod consume;
pub mod inspect;

pub use analyze::handle_analyze;
pub use consume::{ConsumeSource, handle_consume};
pub use inspect::handle_inspect;

use anyhow::{Context, Result};
use std::sync::Arc;

use airops::config::{StorageBackend, StorageSettings};
use airops::storage::{FsWindowStore, S3WindowStore, WindowStore};

/// Open the window store selected by the storage settings
pub async fn open_window_store(settings: &StorageSettings) -> Result<Arc<dyn WindowStore>> {
    match settings.backend {
        StorageBackend::Fs => Ok(Arc::new(FsWindowStore::new(
            settings.root.clone(),
            settings.prefix.clone(),
        ))),
        StorageBackend::S3 => {
            let bucket = settings
                .bucket
                .clone()
                .context("storage.bucket is required for the s3 backend")?;
            Ok(Arc::new(
                S3WindowStore::from_env(bucket, settings.prefix.clone()).await,
            ))
        }
    }
}
