//! # Audio Module
//!
//! Per-guild playback: the connection registry, the playback loop and the
//! external process pipeline that feeds it.
//!
//! ## Architecture
//!
//! ### [`player`] - Connection Registry
//! - One [`VoiceConnection`] per guild, created on first join
//! - Entry point for every command (enqueue, start, skip, pause, ...)
//!
//! ### [`connection`] - Voice Connection
//! - Queue, now playing, debug flag and transport handle behind one lock
//! - Owns the close/control signals of at most one playback loop
//!
//! ### [`playback`] - Playback Loop
//! - WaitingForQueue / Playing / Paused / Closed state machine
//! - Paced by the transport's bounded frame channel
//!
//! ### [`pipeline`] + [`frames`] - Stage Pipeline
//! - fetch -> transcode -> encode, joined with OS pipes
//! - Length-prefixed Opus frames read from the encoder's stdout
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo (2 channels)
//! - **Frames**: 20ms Opus packets, `u16` little-endian length prefix
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serenity::model::id::{ChannelId, GuildId};
//! use tunes::{audio::Player, config::EngineConfig, transport::Transport};
//!
//! # async fn example(transport: Arc<dyn Transport>) -> anyhow::Result<()> {
//! let player = Player::new(transport, EngineConfig::default());
//! let connection = player.join(ChannelId::new(123456789)).await?;
//! let guild_id: GuildId = connection.guild_id();
//!
//! player.enqueue(guild_id, "never gonna give you up", "rick").await?;
//! player.start(guild_id)?;
//!
//! player.pause(guild_id).await?;
//! player.resume(guild_id).await?;
//! player.skip(guild_id).await?;
//! player.stop(guild_id)?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod frames;
pub mod pipeline;
pub mod playback;
pub mod player;

pub use connection::{format_queue_line, ConnectionInfo, ConnectionSnapshot, VoiceConnection};
pub use playback::{Control, LoopState};
pub use player::Player;
