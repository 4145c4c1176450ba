use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::info;

use crate::models::TenantId;
use crate::player::{spawn_player, PlayerDeps, PlayerHandle};
use crate::traits::TenantEvents;

/// Owns one player per active tenant.
pub struct Registry {
    deps: PlayerDeps,
    players: Mutex<HashMap<TenantId, PlayerHandle>>,
}

impl Registry {
    pub fn new(deps: PlayerDeps) -> Self {
        Self {
            deps,
            players: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the tenant's player, creating it if it is missing or closed.
    pub fn player(&self, tenant: TenantId) -> PlayerHandle {
        let mut players = self.players.lock();

        if let Some(player) = players.get(&tenant) {
            if !player.is_closed() {
                return player.clone();
            }
            info!(tenant = %tenant, "replacing closed player");
        }

        let player = spawn_player(tenant, self.deps.clone());
        players.insert(tenant, player.clone());
        player
    }

    pub fn get(&self, tenant: TenantId) -> Option<PlayerHandle> {
        self.players.lock().get(&tenant).cloned()
    }

    pub fn players(&self) -> Vec<(TenantId, PlayerHandle)> {
        self.players
            .lock()
            .iter()
            .map(|(tenant, player)| (*tenant, player.clone()))
            .collect()
    }

    /// Closes every player and its voice session. Stored playlists are kept.
    pub async fn shutdown(&self) {
        let players: Vec<PlayerHandle> = self.players.lock().drain().map(|(_, player)| player).collect();
        info!(players = players.len(), "shutting down players");

        join_all(players.iter().map(|player| player.shutdown())).await;
    }
}

#[async_trait]
impl TenantEvents for Registry {
    async fn on_tenant_join(&self, tenant: TenantId) {
        let player = self.player(tenant);
        info!(tenant = %player.tenant(), "tenant joined");
    }

    async fn on_tenant_leave(&self, tenant: TenantId) {
        let removed = self.players.lock().remove(&tenant);

        if let Some(player) = removed {
            player.stop().await;
            info!(tenant = %tenant, "tenant left, player stopped");
        }
    }
}
