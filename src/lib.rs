//! # tunes
//!
//! Per-guild voice playback for Discord. Each guild gets a queue of media
//! items and a playback loop that streams them through an external
//! `yt-dlp -> ffmpeg -> dca` pipeline into a songbird call.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod transport;
