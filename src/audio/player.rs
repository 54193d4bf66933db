use chrono::Utc;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    connection::{format_queue_line, ConnectionInfo, VoiceConnection},
    playback::Control,
};
use crate::{
    config::EngineConfig,
    error::{PlayerError, TransportError},
    sources::{EnqueueReport, Locator, Resolver},
    storage::Snapshot,
    transport::{ChannelKind, Transport},
};

/// Registry of per-guild voice connections and the operations command
/// handlers run against them.
///
/// The map is the only shared structure between guilds; everything else
/// lives on the individual [`VoiceConnection`].
pub struct Player {
    connections: DashMap<GuildId, Arc<VoiceConnection>>,
    transport: Arc<dyn Transport>,
    resolver: Resolver,
    config: Arc<EngineConfig>,
}

impl Player {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self {
            connections: DashMap::new(),
            transport,
            resolver: Resolver::new(config.resolver.clone()),
            config: Arc::new(config),
        }
    }

    pub fn connection(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        self.connections.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    fn require(&self, guild_id: GuildId) -> Result<Arc<VoiceConnection>, PlayerError> {
        self.connection(guild_id)
            .ok_or(PlayerError::NoConnection(guild_id))
    }

    /// Joins a voice channel, creating the guild's connection on first use.
    /// Rejoining updates the stored channel and transport handle in place.
    pub async fn join(&self, channel_id: ChannelId) -> Result<Arc<VoiceConnection>, PlayerError> {
        let channel = self.transport.resolve(channel_id).await?;
        if channel.kind != ChannelKind::Voice {
            return Err(TransportError::NotVoiceChannel(channel_id).into());
        }

        let guild_id = channel.guild_id;
        let connection = self
            .connections
            .entry(guild_id)
            .or_insert_with(|| Arc::new(VoiceConnection::new(guild_id, self.config.max_queue_size)))
            .clone();

        // Deafened: the bot never listens.
        let handle = self.transport.join(guild_id, channel_id, false, true).await?;
        connection.attach(channel_id, handle);

        info!(%guild_id, %channel_id, "joined voice channel");
        Ok(connection)
    }

    /// Stops playback, leaves voice and forgets the guild.
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let (_, connection) = self
            .connections
            .remove(&guild_id)
            .ok_or(PlayerError::NoConnection(guild_id))?;

        let _ = connection.stop();
        connection.detach();
        self.transport.leave(guild_id).await?;
        info!(%guild_id, "left voice channel");
        Ok(())
    }

    /// The voice session ended outside our control (kicked, channel
    /// deleted). The loop keeps running and idles until the next join.
    pub fn voice_lost(&self, guild_id: GuildId) {
        if let Some(handle) = self.connection(guild_id).and_then(|c| c.detach()) {
            handle.set_ready(false);
            warn!(%guild_id, "voice connection lost");
        }
    }

    /// Resolves `locator` and appends the results to the guild's queue.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        locator: &str,
        requester: &str,
    ) -> Result<EnqueueReport, PlayerError> {
        let connection = self.require(guild_id)?;
        let locator = Locator::parse(locator).ok_or(PlayerError::EmptyLocator)?;
        Ok(self.resolver.enqueue(&connection, &locator, requester).await?)
    }

    /// Starts the guild's playback loop; fails if one is already running.
    pub fn start(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.require(guild_id)?.start(self.config.clone())
    }

    pub fn stop(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.require(guild_id)?.stop()
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.require(guild_id)?.send(Control::Skip).await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.require(guild_id)?.send(Control::Pause).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.require(guild_id)?.send(Control::Resume).await
    }

    pub fn clear(&self, guild_id: GuildId) -> Result<usize, PlayerError> {
        Ok(self.require(guild_id)?.clear())
    }

    pub fn toggle_debug(&self, guild_id: GuildId) -> Result<bool, PlayerError> {
        Ok(self.require(guild_id)?.toggle_debug())
    }

    pub fn info(&self, guild_id: GuildId) -> Result<ConnectionInfo, PlayerError> {
        Ok(self.require(guild_id)?.info())
    }

    /// One line per queued item, the head marked when it is playing.
    pub fn listing(&self, guild_id: GuildId) -> Result<Vec<String>, PlayerError> {
        let connection = self.require(guild_id)?;
        let playing = connection.now_playing();

        Ok(connection
            .queue()
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let now_playing = index == 0 && playing.as_ref().is_some_and(|p| p.same_entry(item));
                format_queue_line(index + 1, item, now_playing)
            })
            .collect())
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        connections.sort_by_key(|c| c.guild_id);

        Snapshot {
            saved_at: Utc::now(),
            connections,
        }
    }

    /// Loads persisted connections. Guilds already present are left alone.
    pub fn restore(&self, snapshot: Snapshot) -> usize {
        let mut restored = 0;
        for saved in snapshot.connections {
            let guild_id = saved.guild_id;
            self.connections.entry(guild_id).or_insert_with(|| {
                restored += 1;
                Arc::new(VoiceConnection::from_snapshot(saved, self.config.max_queue_size))
            });
        }
        info!(restored, "restored voice connections");
        restored
    }

    /// Rejoins every known channel and starts its loop. Per-guild failures
    /// are logged; returns how many guilds are playing afterwards.
    pub async fn resume_all(&self) -> usize {
        let targets: Vec<_> = self
            .connections
            .iter()
            .filter_map(|entry| entry.value().channel_id().map(|c| (*entry.key(), c)))
            .collect();

        let joins = targets.into_iter().map(|(guild_id, channel_id)| async move {
            match self.join(channel_id).await {
                Ok(connection) => match connection.start(self.config.clone()) {
                    Ok(()) | Err(PlayerError::AlreadyRunning(_)) => true,
                    Err(e) => {
                        warn!(%guild_id, "could not start playback: {}", e);
                        false
                    }
                },
                Err(e) => {
                    warn!(%guild_id, %channel_id, "could not rejoin: {}", e);
                    false
                }
            }
        });

        futures::future::join_all(joins)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// Stops every loop, e.g. before process exit.
    pub fn stop_all(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::ConnectionSnapshot,
        transport::{ChannelInfo, MockTransport, VoiceHandle},
    };
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    const GUILD: u64 = 707620933841453186;

    fn voice_transport(voice: u64, text: u64) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_resolve().returning(move |channel| {
            let kind = if channel.get() == voice {
                ChannelKind::Voice
            } else if channel.get() == text {
                ChannelKind::Text
            } else {
                return Err(TransportError::Lookup {
                    channel,
                    reason: "unknown".into(),
                });
            };
            Ok(ChannelInfo {
                guild_id: GuildId::new(GUILD),
                kind,
            })
        });
        transport
    }

    #[tokio::test]
    async fn join_rejects_non_voice_channels() {
        let mut transport = voice_transport(10, 11);
        transport.expect_join().never();
        let player = Player::new(Arc::new(transport), EngineConfig::default());

        let err = player.join(ChannelId::new(11)).await.unwrap_err();
        assert!(matches!(err, PlayerError::Transport(TransportError::NotVoiceChannel(_))));
        assert!(player.guilds().is_empty());

        let err = player.join(ChannelId::new(99)).await.unwrap_err();
        assert!(matches!(err, PlayerError::Transport(TransportError::Lookup { .. })));
    }

    #[tokio::test]
    async fn rejoin_reuses_the_connection() {
        let mut transport = voice_transport(10, 11);
        transport
            .expect_join()
            .with(eq(GuildId::new(GUILD)), eq(ChannelId::new(10)), eq(false), eq(true))
            .times(2)
            .returning(|_, _, _, _| Ok(VoiceHandle::ready(flume::bounded(1).0)));
        let player = Player::new(Arc::new(transport), EngineConfig::default());

        let first = player.join(ChannelId::new(10)).await.unwrap();
        first.push(crate::sources::MediaItem {
            id: "a".into(),
            source_url: "https://example.com/a".into(),
            ..Default::default()
        });
        let second = player.join(ChannelId::new(10)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(player.guilds(), vec![GuildId::new(GUILD)]);
        assert_eq!(second.queue_len(), 1);
        assert_eq!(second.channel_id(), Some(ChannelId::new(10)));
    }

    #[tokio::test]
    async fn commands_without_connection_fail() {
        let player = Player::new(Arc::new(MockTransport::new()), EngineConfig::default());
        let guild = GuildId::new(GUILD);

        assert!(matches!(player.start(guild), Err(PlayerError::NoConnection(_))));
        assert!(matches!(player.skip(guild).await, Err(PlayerError::NoConnection(_))));
        assert!(matches!(
            player.enqueue(guild, "song", "u").await,
            Err(PlayerError::NoConnection(_))
        ));
        assert!(matches!(player.leave(guild).await, Err(PlayerError::NoConnection(_))));
    }

    #[tokio::test]
    async fn empty_locator_is_rejected() {
        let player = Player::new(Arc::new(MockTransport::new()), EngineConfig::default());
        let guild = GuildId::new(GUILD);
        player.restore(Snapshot {
            saved_at: Utc::now(),
            connections: vec![VoiceConnection::new(guild, 10).snapshot()],
        });

        assert!(matches!(
            player.enqueue(guild, "   ", "u").await,
            Err(PlayerError::EmptyLocator)
        ));
    }

    #[tokio::test]
    async fn listing_numbers_queue_entries() {
        let player = Player::new(Arc::new(MockTransport::new()), EngineConfig::default());
        let guild = GuildId::new(GUILD);
        let connection = VoiceConnection::new(guild, 10);
        for id in ["a", "b"] {
            connection.push(crate::sources::MediaItem {
                id: id.into(),
                title: id.to_uppercase(),
                source_url: format!("https://example.com/{}", id),
                duration: 61,
                added_by: "u".into(),
                ..Default::default()
            });
        }
        player.restore(Snapshot {
            saved_at: Utc::now(),
            connections: vec![connection.snapshot()],
        });

        assert_eq!(
            player.listing(guild).unwrap(),
            vec!["`001:a` **A** [1m 1s] - *u*", "`002:b` **B** [1m 1s] - *u*"]
        );
    }

    #[tokio::test]
    async fn leave_stops_and_forgets() {
        let mut transport = voice_transport(10, 11);
        transport
            .expect_join()
            .returning(|_, _, _, _| Ok(VoiceHandle::ready(flume::bounded(1).0)));
        transport
            .expect_leave()
            .with(eq(GuildId::new(GUILD)))
            .times(1)
            .returning(|_| Ok(()));
        let player = Player::new(Arc::new(transport), EngineConfig::default());

        let connection = player.join(ChannelId::new(10)).await.unwrap();
        player.start(connection.guild_id()).unwrap();
        player.leave(connection.guild_id()).await.unwrap();

        assert!(!connection.is_running());
        assert!(player.connection(connection.guild_id()).is_none());
    }

    #[tokio::test]
    async fn lost_voice_idles_the_connection() {
        let mut transport = voice_transport(10, 11);
        let (tx, _rx) = flume::bounded(1);
        let handle = VoiceHandle::ready(tx);
        let returned = handle.clone();
        transport
            .expect_join()
            .returning(move |_, _, _, _| Ok(returned.clone()));
        let player = Player::new(Arc::new(transport), EngineConfig::default());

        let connection = player.join(ChannelId::new(10)).await.unwrap();
        player.voice_lost(connection.guild_id());

        assert!(!handle.is_ready());
        assert_eq!(connection.channel_id(), Some(ChannelId::new(10)));
    }

    #[tokio::test]
    async fn snapshot_restore_and_resume() {
        let mut transport = voice_transport(10, 11);
        transport
            .expect_join()
            .times(1)
            .returning(|_, _, _, _| Ok(VoiceHandle::ready(flume::bounded(1).0)));
        let player = Player::new(Arc::new(transport), EngineConfig::default());

        let restored = player.restore(Snapshot {
            saved_at: Utc::now(),
            connections: vec![ConnectionSnapshot {
                guild_id: GuildId::new(GUILD),
                channel_id: Some(ChannelId::new(10)),
                debug: false,
                queue: Vec::new(),
            }],
        });
        assert_eq!(restored, 1);

        assert_eq!(player.resume_all().await, 1);
        assert!(player.connection(GuildId::new(GUILD)).unwrap().is_running());
        assert_eq!(player.snapshot().connections.len(), 1);
        player.stop_all();
    }
}
