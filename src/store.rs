//! Per-tenant queue snapshots that survive a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::models::{PlaylistSnapshot, TenantId};
use crate::traits::PlaylistStore;

#[derive(Default)]
pub struct MemoryPlaylistStore {
    snapshots: Mutex<HashMap<TenantId, PlaylistSnapshot>>,
}

impl MemoryPlaylistStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaylistStore for MemoryPlaylistStore {
    async fn load(&self, tenant: TenantId) -> Result<Option<PlaylistSnapshot>> {
        Ok(self.snapshots.lock().get(&tenant).cloned())
    }

    async fn save(&self, tenant: TenantId, snapshot: &PlaylistSnapshot) -> Result<()> {
        self.snapshots.lock().insert(tenant, snapshot.clone());
        Ok(())
    }
}

/// One `<tenant>.json` file per tenant under `dir`.
pub struct JsonPlaylistStore {
    dir: PathBuf,
}

impl JsonPlaylistStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, tenant: TenantId) -> PathBuf {
        self.dir.join(format!("{tenant}.json"))
    }
}

#[async_trait]
impl PlaylistStore for JsonPlaylistStore {
    async fn load(&self, tenant: TenantId) -> Result<Option<PlaylistSnapshot>> {
        let path = self.path(tenant);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let snapshot: PlaylistSnapshot = serde_json::from_slice(&data)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, tenant: TenantId, snapshot: &PlaylistSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path(tenant);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(snapshot)?;

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(tenant = %tenant, songs = snapshot.songs.len(), "playlist saved");
        Ok(())
    }
}
