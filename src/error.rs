//! # Error Types
//!
//! Typed errors for the playback engine. Command-level failures
//! ([`PlayerError`]) are returned to whoever issued the command; pipeline
//! failures ([`PipelineError`], [`FrameError`]) never leave the playback loop
//! that owns the pipeline.

use serenity::model::id::{ChannelId, GuildId};
use std::time::Duration;
use thiserror::Error;

use crate::audio::pipeline::Stage;

/// Resolver Stage failures. Reported to the caller, never retried.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("failed to start resolver `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resolver produced no output stream")]
    MissingStdout,

    #[error("failed reading resolver output: {0}")]
    Read(#[source] std::io::Error),

    #[error("no playable results for `{0}`")]
    NoResults(String),
}

/// Channel lookup or voice join failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("channel lookup failed for {channel}: {reason}")]
    Lookup { channel: ChannelId, reason: String },

    #[error("channel {0} does not belong to a server")]
    NotInGuild(ChannelId),

    #[error("that's not a voice channel")]
    NotVoiceChannel(ChannelId),

    #[error("failed to join voice channel {channel} in guild {guild}: {reason}")]
    Join {
        guild: GuildId,
        channel: ChannelId,
        reason: String,
    },

    #[error("failed to leave voice in guild {guild}: {reason}")]
    Leave { guild: GuildId, reason: String },
}

/// Failures that abort playback of a single item.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{stage} stage failed to start: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} stage has no stdout")]
    MissingStdout(Stage),

    #[error("could not wire {stage} output into the next stage: {source}")]
    Wire {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("no frame from the pipeline within {0:?}")]
    StageStalled(Duration),

    #[error("transport did not accept a frame within {0:?}")]
    TransportStalled(Duration),

    #[error("transport frame channel closed")]
    TransportClosed,

    #[error("frame read failed: {0}")]
    Read(#[source] std::io::Error),
}

/// Frame stream decoding failures.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Stream ended inside a header or payload.
    #[error("frame stream truncated ({buffered} bytes left over)")]
    Truncated { buffered: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported directly to the requester of a command.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("There is no voice connection for this Guild.")]
    NoConnection(GuildId),

    #[error("cannot enqueue an empty string")]
    EmptyLocator,

    #[error("playback is already running for guild {0}")]
    AlreadyRunning(GuildId),

    #[error("playback is not running for guild {0}")]
    NotRunning(GuildId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}
