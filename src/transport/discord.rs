//! serenity channel lookup + songbird voice.
//!
//! songbird does the Opus/RTP side. Each joined call plays one endless live
//! input that reads our frame channel as a DCA1 stream; when no frame is
//! waiting it emits an Opus silence frame so the mixer never stalls.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serenity::{
    http::Http,
    model::{
        channel::{Channel, ChannelType},
        id::{ChannelId, GuildId},
    },
};
use songbird::{
    input::{AudioStream, Input, LiveInput},
    Songbird,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::{io::MediaSource, probe::Hint};
use tracing::{debug, info};

use super::{ChannelInfo, ChannelKind, Transport, VoiceHandle};
use crate::{
    audio::frames::{encode_frame, FRAME_DURATION},
    error::TransportError,
};

/// Opus "silence" frame.
const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

pub struct DiscordTransport {
    http: Arc<Http>,
    songbird: Arc<Songbird>,
    frame_buffer: usize,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>, songbird: Arc<Songbird>, frame_buffer: usize) -> Self {
        Self {
            http,
            songbird,
            frame_buffer: frame_buffer.max(1),
        }
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn resolve(&self, channel_id: ChannelId) -> Result<ChannelInfo, TransportError> {
        let channel = self
            .http
            .get_channel(channel_id)
            .await
            .map_err(|e| TransportError::Lookup {
                channel: channel_id,
                reason: e.to_string(),
            })?;

        let Channel::Guild(channel) = channel else {
            return Err(TransportError::NotInGuild(channel_id));
        };

        let kind = match channel.kind {
            ChannelType::Voice => ChannelKind::Voice,
            ChannelType::Stage => ChannelKind::Stage,
            ChannelType::Text => ChannelKind::Text,
            _ => ChannelKind::Other,
        };

        Ok(ChannelInfo {
            guild_id: channel.guild_id,
            kind,
        })
    }

    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        muted: bool,
        deafened: bool,
    ) -> Result<VoiceHandle, TransportError> {
        let join_error = |reason: String| TransportError::Join {
            guild: guild_id,
            channel: channel_id,
            reason,
        };

        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|e| join_error(e.to_string()))?;

        let (frames, receiver) = flume::bounded(self.frame_buffer);
        let handle = VoiceHandle::new(frames);

        {
            let mut call = call.lock().await;
            call.mute(muted).await.map_err(|e| join_error(e.to_string()))?;
            call.deafen(deafened)
                .await
                .map_err(|e| join_error(e.to_string()))?;

            // A rejoin replaces the previous frame input.
            call.stop();
            call.play_input(frame_input(receiver));
        }

        handle.set_ready(true);
        info!(%guild_id, %channel_id, "voice connected");
        Ok(handle)
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.songbird
            .remove(guild_id)
            .await
            .map_err(|e| TransportError::Leave {
                guild: guild_id,
                reason: e.to_string(),
            })?;
        debug!(%guild_id, "voice disconnected");
        Ok(())
    }
}

fn frame_input(frames: flume::Receiver<Bytes>) -> Input {
    let mut hint = Hint::new();
    hint.with_extension("dca");

    let source: Box<dyn MediaSource> = Box::new(DcaFrameSource::new(frames));
    Input::Live(
        LiveInput::Raw(AudioStream {
            input: source,
            hint: Some(hint),
        }),
        None,
    )
}

/// Blocking reader that presents the frame channel as a DCA1 container.
pub struct DcaFrameSource {
    frames: flume::Receiver<Bytes>,
    pending: Bytes,
}

impl DcaFrameSource {
    pub fn new(frames: flume::Receiver<Bytes>) -> Self {
        Self {
            frames,
            pending: dca_header(),
        }
    }

    /// `false` once every sender is gone. Empty frames go out as silence;
    /// the DCA reader would take a zero length as end of stream.
    fn refill(&mut self) -> bool {
        let frame = match self.frames.try_recv() {
            Ok(frame) if !frame.is_empty() => frame,
            Ok(_) | Err(flume::TryRecvError::Empty) => Bytes::from_static(&SILENT_FRAME),
            Err(flume::TryRecvError::Disconnected) => return false,
        };

        let mut out = BytesMut::with_capacity(frame.len() + 2);
        encode_frame(&frame, &mut out);
        self.pending = out.freeze();
        true
    }
}

fn dca_header() -> Bytes {
    let metadata = serde_json::json!({
        "dca": {
            "version": 1,
            "tool": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "url": "",
                "author": "",
            },
        },
        "opus": {
            "mode": "music",
            "sample_rate": 48000,
            "frame_size": 48 * FRAME_DURATION.as_millis() as u64,
            "abr": 128000,
            "vbr": true,
            "channels": 2,
        },
    })
    .to_string();

    let mut header = BytesMut::with_capacity(8 + metadata.len());
    header.extend_from_slice(b"DCA1");
    header.put_i32_le(metadata.len() as i32);
    header.extend_from_slice(metadata.as_bytes());
    header.freeze()
}

impl Read for DcaFrameSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() && !self.refill() {
            return Ok(0);
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Seek for DcaFrameSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live frame stream cannot seek",
        ))
    }
}

impl MediaSource for DcaFrameSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
