use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::TenantId;
use crate::player::PlayerHandle;
use crate::registry::Registry;
use crate::traits::PresenceQuery;

/// Stops players whose voice channel has nobody left but the bot.
pub struct PresenceMonitor {
    registry: Arc<Registry>,
    presence: Arc<dyn PresenceQuery>,
    period: Duration,
}

impl PresenceMonitor {
    pub fn new(registry: Arc<Registry>, presence: Arc<dyn PresenceQuery>, period: Duration) -> Self {
        Self {
            registry,
            presence,
            period,
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("presence monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
    }

    /// Returns how many players were stopped.
    ///
    /// Tenants are checked concurrently, so one slow player or presence
    /// query does not hold up the others.
    pub async fn check(&self) -> usize {
        let players = self.registry.players();
        let stopped = join_all(
            players
                .into_iter()
                .map(|(tenant, player)| self.check_tenant(tenant, player)),
        )
        .await;

        stopped.into_iter().filter(|stopped| *stopped).count()
    }

    async fn check_tenant(&self, tenant: TenantId, player: PlayerHandle) -> bool {
        let channel = match player.voice_channel().await {
            Ok(Some(channel)) => channel,
            Ok(None) | Err(_) => return false,
        };

        match self.presence.occupancy(tenant, channel).await {
            Ok(members) if members <= 1 => {
                info!(tenant = %tenant, channel = %channel, "no listeners left, stopping player");
                player.stop().await;
                true
            }
            Ok(members) => {
                debug!(tenant = %tenant, members, "listeners present");
                false
            }
            Err(err) => {
                warn!(tenant = %tenant, error = %err, "could not query voice occupancy");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::metrics::Metrics;
    use crate::models::{ChannelRef, PlayerState, Song};
    use crate::player::PlayerDeps;
    use crate::source::AudioPipeline;
    use crate::store::MemoryPlaylistStore;
    use crate::streamer::FrameStreamer;
    use crate::testing::{FakeFetcher, FakePresence, FakeTransport, RecordingNotifier, FRAME_INTERVAL};

    async fn playing_registry(tenants: &[u64]) -> Arc<Registry> {
        let pipeline = AudioPipeline::new(
            Arc::new(FakeFetcher::new(10_000)),
            &EngineConfig::default(),
            Arc::new(Metrics::new()),
        );
        let registry = Arc::new(Registry::new(PlayerDeps {
            pipeline: Arc::new(pipeline),
            streamer: FrameStreamer::new(FRAME_INTERVAL, 2),
            transport: Arc::new(FakeTransport::new()),
            notifier: Arc::new(RecordingNotifier::default()),
            store: Arc::new(MemoryPlaylistStore::new()),
        }));

        for &tenant in tenants {
            registry
                .player(TenantId(tenant))
                .add_song(ChannelRef(tenant), ChannelRef(tenant * 100), Song::new("A", "https://youtu.be/a"))
                .await
                .unwrap();
        }

        registry
    }

    #[tokio::test(start_paused = true)]
    async fn stops_only_abandoned_channels() {
        let registry = playing_registry(&[1, 2, 3]).await;
        let presence = Arc::new(FakePresence::default());
        presence.set(TenantId(1), ChannelRef(100), 1);
        presence.set(TenantId(2), ChannelRef(200), 3);
        presence.make_unreachable(TenantId(3));

        let monitor = PresenceMonitor::new(registry.clone(), presence, Duration::from_secs(60));
        assert_eq!(monitor.check().await, 1);

        assert_eq!(registry.get(TenantId(1)).unwrap().state().await, PlayerState::Closed);
        assert_ne!(registry.get(TenantId(2)).unwrap().state().await, PlayerState::Closed);
        assert_ne!(registry.get(TenantId(3)).unwrap().state().await, PlayerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let registry = playing_registry(&[1]).await;
        let presence = Arc::new(FakePresence::default());
        presence.set(TenantId(1), ChannelRef(100), 2);

        let shutdown = CancellationToken::new();
        let monitor = PresenceMonitor::new(registry.clone(), presence.clone(), Duration::from_secs(60));
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        let player = registry.get(TenantId(1)).unwrap();
        assert_ne!(player.state().await, PlayerState::Closed);

        // The listener leaves; the next tick notices.
        presence.set(TenantId(1), ChannelRef(100), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(player.state().await, PlayerState::Closed);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tenants_are_checked_side_by_side() {
        let registry = playing_registry(&[1, 2, 3]).await;
        let presence = Arc::new(FakePresence::default());
        for tenant in 1..=3 {
            presence.set(TenantId(tenant), ChannelRef(tenant * 100), 1);
        }
        presence.respond_after(Duration::from_secs(10));

        let monitor = PresenceMonitor::new(registry.clone(), presence, Duration::from_secs(60));
        let start = tokio::time::Instant::now();

        assert_eq!(monitor.check().await, 3);
        assert!(start.elapsed() < Duration::from_secs(11));
    }
}
