//! The per-guild playback loop.
//!
//! ```text
//! WaitingForQueue --(ready + queued)--> Playing <--Pause/Resume--> Paused
//!        ^                                 |
//!        +---- end of stream / Skip / error+
//!        +---- transport lost (head kept) -+
//! any state --(close)--> Closed
//! ```
//!
//! One `select!` serves every state: the close token and the control channel
//! are polled everywhere, the frame read only while playing.

use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{process::ChildStdout, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    connection::{NextItem, VoiceConnection},
    frames::FrameReader,
    pipeline::Pipeline,
};
use crate::{
    config::EngineConfig,
    error::{FrameError, PipelineError},
    sources::MediaItem,
};

/// Messages carried by a connection's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Skip,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForQueue,
    Playing,
    Paused,
    Closed,
}

/// Why an item stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemEnd {
    Finished,
    Skipped,
    Failed,
    /// The transport went away or stopped taking frames. The item stays at
    /// the head and is played again once a transport is ready.
    Interrupted,
    Closed,
}

impl ItemEnd {
    fn dequeues(self) -> bool {
        matches!(self, ItemEnd::Finished | ItemEnd::Skipped | ItemEnd::Failed)
    }
}

pub(crate) struct PlaybackLoop {
    connection: Arc<VoiceConnection>,
    config: Arc<EngineConfig>,
    close: CancellationToken,
    control: flume::Receiver<Control>,
}

impl PlaybackLoop {
    pub(crate) fn new(
        connection: Arc<VoiceConnection>,
        config: Arc<EngineConfig>,
        close: CancellationToken,
        control: flume::Receiver<Control>,
    ) -> Self {
        Self {
            connection,
            config,
            close,
            control,
        }
    }

    /// Runs until closed. `previous` is the loop this one replaces; it is
    /// awaited first so the two never share the queue.
    pub(crate) async fn run(self, previous: Option<JoinHandle<()>>) {
        let guild_id = self.connection.guild_id();
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!(%guild_id, "previous playback loop ended abnormally: {}", e);
            }
        }
        debug!(%guild_id, "playback loop running");

        loop {
            if self.close.is_cancelled() {
                break;
            }

            let Some(next) = self.connection.begin_next() else {
                self.connection.set_loop_state(LoopState::WaitingForQueue);
                if self.wait_for_queue().await == LoopState::Closed {
                    break;
                }
                continue;
            };

            let item = next.item.clone();
            info!(%guild_id, id = %item.id, title = %item.title, "now playing");
            let end = self.stream(&item, next).await;
            if end.dequeues() {
                self.connection.finish(&item);
            } else {
                self.connection.release();
            }
            info!(%guild_id, id = %item.id, reason = ?end, "item ended");

            match end {
                ItemEnd::Closed => break,
                ItemEnd::Interrupted => {
                    self.connection.set_loop_state(LoopState::WaitingForQueue);
                    if self.wait_for_queue().await == LoopState::Closed {
                        break;
                    }
                }
                _ => {}
            }
        }

        self.connection.closed();
        info!(%guild_id, "playback loop exited");
    }

    /// One backoff period of WaitingForQueue. Control messages are taken and
    /// dropped so senders never wait on an idle loop.
    async fn wait_for_queue(&self) -> LoopState {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => LoopState::Closed,
            message = self.control.recv_async() => match message {
                Ok(message) => {
                    debug!(guild_id = %self.connection.guild_id(), ?message, "nothing playing, control ignored");
                    LoopState::WaitingForQueue
                }
                Err(_) => LoopState::Closed,
            },
            _ = tokio::time::sleep(self.config.poll_interval) => LoopState::WaitingForQueue,
        }
    }

    async fn stream(&self, item: &MediaItem, next: NextItem) -> ItemEnd {
        let guild_id = self.connection.guild_id();
        let mut pipeline = match Pipeline::spawn(&self.config.stages, item, next.debug) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(%guild_id, id = %item.id, "pipeline failed: {}", e);
                return ItemEnd::Failed;
            }
        };

        let mut paused = false;
        let mut frames_sent: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => return ItemEnd::Closed,
                message = self.control.recv_async() => match message {
                    Ok(Control::Skip) => {
                        info!(%guild_id, id = %item.id, "skipped");
                        return ItemEnd::Skipped;
                    }
                    Ok(Control::Pause) if !paused => {
                        paused = true;
                        self.connection.set_loop_state(LoopState::Paused);
                        info!(%guild_id, id = %item.id, "paused");
                    }
                    Ok(Control::Resume) if paused => {
                        paused = false;
                        self.connection.set_loop_state(LoopState::Playing);
                        info!(%guild_id, id = %item.id, "resumed");
                    }
                    Ok(_) => {}
                    Err(_) => return ItemEnd::Closed,
                },
                read = self.read_frame(pipeline.frames()), if !paused => {
                    let frame = match read {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return ItemEnd::Finished,
                        Err(e) => {
                            warn!(%guild_id, id = %item.id, "playback aborted: {}", e);
                            return ItemEnd::Failed;
                        }
                    };
                    match self.deliver(&next.frames, frame).await {
                        Ok(true) => {
                            frames_sent += 1;
                            self.connection.record_progress(frames_sent);
                        }
                        Ok(false) => return ItemEnd::Closed,
                        Err(e) => {
                            warn!(%guild_id, id = %item.id, "playback interrupted: {}", e);
                            return ItemEnd::Interrupted;
                        }
                    }
                }
            }
        }
    }

    /// Next frame, with truncation treated as a normal end of stream and
    /// an optional watchdog on silent stages.
    async fn read_frame(
        &self,
        frames: &mut FrameReader<ChildStdout>,
    ) -> Result<Option<Bytes>, PipelineError> {
        let read = match self.config.stage_read_timeout {
            Some(limit) => tokio::time::timeout(limit, frames.next_frame())
                .await
                .map_err(|_| PipelineError::StageStalled(limit))?,
            None => frames.next_frame().await,
        };

        match read {
            Ok(frame) => Ok(frame),
            Err(FrameError::Truncated { buffered }) => {
                debug!(guild_id = %self.connection.guild_id(), buffered, "frame stream truncated");
                Ok(None)
            }
            Err(FrameError::Io(e)) => Err(PipelineError::Read(e)),
        }
    }

    /// Blocks on the transport's frame channel; this is the pacing point.
    /// `Ok(false)` means the close signal fired while waiting.
    async fn deliver(
        &self,
        frames: &flume::Sender<Bytes>,
        frame: Bytes,
    ) -> Result<bool, PipelineError> {
        let limit: Duration = self.config.frame_send_timeout;
        tokio::select! {
            biased;
            _ = self.close.cancelled() => Ok(false),
            sent = tokio::time::timeout(limit, frames.send_async(frame)) => match sent {
                Ok(Ok(())) => Ok(true),
                Ok(Err(_)) => Err(PipelineError::TransportClosed),
                Err(_) => Err(PipelineError::TransportStalled(limit)),
            },
        }
    }
}
