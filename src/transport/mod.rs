//! # Transport
//!
//! The real-time side of playback: channel lookup, voice join, and the
//! outbound frame channel the playback loop writes into. [`Transport`] is the
//! seam; [`discord::DiscordTransport`] is the serenity + songbird
//! implementation used by the bot.

pub mod discord;

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::TransportError;

pub use discord::DiscordTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Voice,
    Stage,
    Text,
    Other,
}

/// What the transport knows about a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub guild_id: GuildId,
    pub kind: ChannelKind,
}

/// A joined voice channel: readiness plus the outbound frame channel.
///
/// The frame channel is bounded; a full channel makes senders wait, which is
/// what paces playback at real time.
#[derive(Debug, Clone)]
pub struct VoiceHandle {
    ready: Arc<AtomicBool>,
    frames: flume::Sender<Bytes>,
}

impl VoiceHandle {
    /// A handle that is not ready yet.
    pub fn new(frames: flume::Sender<Bytes>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            frames,
        }
    }

    /// A handle that is ready immediately.
    pub fn ready(frames: flume::Sender<Bytes>) -> Self {
        let handle = Self::new(frames);
        handle.set_ready(true);
        handle
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.frames.is_disconnected()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn frames(&self) -> flume::Sender<Bytes> {
        self.frames.clone()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which guild a channel belongs to, and what kind of channel it is.
    async fn resolve(&self, channel_id: ChannelId) -> Result<ChannelInfo, TransportError>;

    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        muted: bool,
        deafened: bool,
    ) -> Result<VoiceHandle, TransportError>;

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError>;
}
