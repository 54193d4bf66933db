use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    frames::FRAME_DURATION,
    playback::{Control, LoopState, PlaybackLoop},
};
use crate::{config::EngineConfig, error::PlayerError, sources::MediaItem, transport::VoiceHandle};

/// Close + control pair handed to one playback loop. Both exist or neither
/// does, which is what keeps a connection at one loop at a time.
pub(crate) struct LoopSignals {
    control: flume::Sender<Control>,
    close: CancellationToken,
}

/// Head of the queue as claimed by the playback loop.
pub(crate) struct NextItem {
    pub item: MediaItem,
    pub frames: flume::Sender<Bytes>,
    pub debug: bool,
}

struct ConnectionState {
    channel_id: Option<ChannelId>,
    queue: VecDeque<MediaItem>,
    playing: Option<MediaItem>,
    loop_state: LoopState,
    debug: bool,
    max_queue_size: usize,
    signals: Option<LoopSignals>,
    /// Most recently spawned loop, possibly still winding down after a stop.
    task: Option<JoinHandle<()>>,
    handle: Option<VoiceHandle>,
}

/// Per-guild playback state.
///
/// The lock is only ever held for short, synchronous sections; the playback
/// loop never holds it while streaming, so queue edits from command
/// handlers run alongside playback.
pub struct VoiceConnection {
    guild_id: GuildId,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}

impl VoiceConnection {
    pub fn new(guild_id: GuildId, max_queue_size: usize) -> Self {
        Self {
            guild_id,
            state: Mutex::new(ConnectionState {
                channel_id: None,
                queue: VecDeque::new(),
                playing: None,
                loop_state: LoopState::Closed,
                debug: false,
                max_queue_size,
                signals: None,
                task: None,
                handle: None,
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.state.lock().channel_id
    }

    /// Stores a fresh transport handle, replacing any previous one.
    pub(crate) fn attach(&self, channel_id: ChannelId, handle: VoiceHandle) {
        let mut state = self.state.lock();
        state.channel_id = Some(channel_id);
        state.handle = Some(handle);
    }

    pub(crate) fn detach(&self) -> Option<VoiceHandle> {
        self.state.lock().handle.take()
    }

    /// Appends to the back of the queue. Returns `false` when the queue is
    /// full or the item has no source locator.
    pub fn push(&self, item: MediaItem) -> bool {
        if !item.is_playable() {
            warn!(guild_id = %self.guild_id, id = %item.id, "refusing item without source url");
            return false;
        }

        let mut state = self.state.lock();
        if state.queue.len() >= state.max_queue_size {
            return false;
        }
        debug!(guild_id = %self.guild_id, title = %item.title, "queued");
        state.queue.push_back(item);
        true
    }

    pub fn queue(&self) -> Vec<MediaItem> {
        self.state.lock().queue.iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Empties the queue. The item currently streaming keeps playing.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let cleared = state.queue.len();
        state.queue.clear();
        info!(guild_id = %self.guild_id, cleared, "queue cleared");
        cleared
    }

    pub fn now_playing(&self) -> Option<MediaItem> {
        self.state.lock().playing.clone()
    }

    pub fn loop_state(&self) -> LoopState {
        self.state.lock().loop_state
    }

    pub fn is_debug(&self) -> bool {
        self.state.lock().debug
    }

    pub fn toggle_debug(&self) -> bool {
        let mut state = self.state.lock();
        state.debug = !state.debug;
        state.debug
    }

    /// Whether a playback loop currently owns this connection's signals.
    pub fn is_running(&self) -> bool {
        self.state.lock().signals.is_some()
    }

    /// Starts the playback loop unless one is already attached.
    ///
    /// The check, the signal installation and the spawn happen under one
    /// lock, so two racing starts cannot both succeed. A loop stopped just
    /// before is handed to the new one, which waits for it to exit before
    /// touching the queue.
    pub fn start(self: &Arc<Self>, config: Arc<EngineConfig>) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if state.signals.is_some() {
            return Err(PlayerError::AlreadyRunning(self.guild_id));
        }

        // Zero capacity: a control send completes only when the loop takes it.
        let (control_tx, control_rx) = flume::bounded(0);
        let close = CancellationToken::new();
        state.signals = Some(LoopSignals {
            control: control_tx,
            close: close.clone(),
        });
        state.loop_state = LoopState::WaitingForQueue;

        let previous = state.task.take();
        let playback = PlaybackLoop::new(self.clone(), config, close, control_rx);
        state.task = Some(tokio::spawn(playback.run(previous)));

        info!(guild_id = %self.guild_id, "starting playback loop");
        Ok(())
    }

    /// Closes both signals and forgets them. The loop exits at its next
    /// check; no frames are sent after it observes the close.
    pub fn stop(&self) -> Result<(), PlayerError> {
        let signals = self
            .state
            .lock()
            .signals
            .take()
            .ok_or(PlayerError::NotRunning(self.guild_id))?;

        signals.close.cancel();
        drop(signals.control);
        info!(guild_id = %self.guild_id, "playback stopped");
        Ok(())
    }

    /// Hands a control message to the playback loop. Returns once the loop
    /// has received it.
    pub async fn send(&self, message: Control) -> Result<(), PlayerError> {
        let control = self
            .state
            .lock()
            .signals
            .as_ref()
            .map(|signals| signals.control.clone())
            .ok_or(PlayerError::NotRunning(self.guild_id))?;

        control
            .send_async(message)
            .await
            .map_err(|_| PlayerError::NotRunning(self.guild_id))?;
        debug!(guild_id = %self.guild_id, ?message, "control delivered");
        Ok(())
    }

    pub fn info(&self) -> ConnectionInfo {
        let state = self.state.lock();
        ConnectionInfo {
            guild_id: self.guild_id,
            channel_id: state.channel_id,
            queue_len: state.queue.len(),
            state: state.loop_state,
            debug: state.debug,
            now_playing: state.playing.clone(),
        }
    }

    /// Claims the head of the queue for playback, if the transport is ready
    /// and the queue is not empty.
    pub(crate) fn begin_next(&self) -> Option<NextItem> {
        let mut state = self.state.lock();
        let frames = match &state.handle {
            Some(handle) if handle.is_ready() => handle.frames(),
            _ => return None,
        };

        let mut item = state.queue.front()?.clone();
        item.remaining = item.duration;
        state.playing = Some(item.clone());
        state.loop_state = LoopState::Playing;

        Some(NextItem {
            item,
            frames,
            debug: state.debug,
        })
    }

    /// Releases the item claimed by [`begin_next`](Self::begin_next),
    /// keeping it at the head for the next claim.
    pub(crate) fn release(&self) {
        self.state.lock().playing = None;
    }

    /// Releases the item claimed by [`begin_next`](Self::begin_next) and
    /// removes it from the queue.
    ///
    /// The head is removed only if it is still that item; a queue cleared or
    /// rebuilt during playback is left untouched.
    pub(crate) fn finish(&self, item: &MediaItem) {
        let mut state = self.state.lock();
        state.playing = None;

        match state.queue.front() {
            Some(head) if head.same_entry(item) => {
                state.queue.pop_front();
            }
            Some(_) => {
                warn!(guild_id = %self.guild_id, id = %item.id, "queue changed during playback, head kept");
            }
            None => {}
        }
    }

    /// Updates `remaining` from the number of frames delivered so far.
    pub(crate) fn record_progress(&self, frames_sent: u64) {
        let elapsed = FRAME_DURATION * frames_sent.min(u32::MAX as u64) as u32;
        let mut state = self.state.lock();
        if let Some(playing) = state.playing.as_mut() {
            playing.remaining = playing
                .duration
                .saturating_sub(elapsed.as_secs());
        }
    }

    pub(crate) fn set_loop_state(&self, loop_state: LoopState) {
        self.state.lock().loop_state = loop_state;
    }

    /// Called by the loop on exit. A loop started after this one was
    /// stopped keeps its state.
    pub(crate) fn closed(&self) {
        let mut state = self.state.lock();
        if state.signals.is_none() {
            state.playing = None;
            state.loop_state = LoopState::Closed;
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock();
        ConnectionSnapshot {
            guild_id: self.guild_id,
            channel_id: state.channel_id,
            debug: state.debug,
            queue: state.queue.iter().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: ConnectionSnapshot, max_queue_size: usize) -> Self {
        let connection = Self::new(snapshot.guild_id, max_queue_size);
        {
            let mut state = connection.state.lock();
            state.channel_id = snapshot.channel_id;
            state.debug = snapshot.debug;
            state.queue = snapshot
                .queue
                .into_iter()
                .filter(MediaItem::is_playable)
                .take(max_queue_size)
                .map(|mut item| {
                    item.remaining = 0;
                    item
                })
                .collect();
        }
        connection
    }
}

/// Persisted form of a [`VoiceConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub queue: Vec<MediaItem>,
}

/// Point-in-time view of a connection for `info` style replies.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub queue_len: usize,
    pub state: LoopState,
    pub debug: bool,
    pub now_playing: Option<MediaItem>,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self
            .channel_id
            .map_or_else(|| "none".to_string(), |id| id.to_string());
        writeln!(f, "`Voice Channel:` {}", channel)?;
        writeln!(f, "`Queue Size:` {}", self.queue_len)?;

        let Some(item) = &self.now_playing else {
            return Ok(());
        };
        writeln!(f, "`Now Playing:`")?;
        writeln!(f, "`ID:` {}", item.id)?;
        writeln!(f, "`Title:` {}", item.title)?;
        writeln!(f, "`Duration:` {}s", item.duration)?;
        writeln!(f, "`Remaining:` {}s", item.remaining)?;
        writeln!(f, "`Source URL:` <{}>", item.source_url)?;
        write!(f, "`Thumbnail:` {}", item.thumbnail)
    }
}

/// One line of a queue listing: index, truncated id, title, duration,
/// requester and a now-playing marker.
pub fn format_queue_line(index: usize, item: &MediaItem, now_playing: bool) -> String {
    let id: String = item.id.chars().take(15).collect();
    let duration = humantime::format_duration(item.duration());
    let marker = if now_playing { " **(Now Playing)**" } else { "" };
    format!(
        "`{:03}:{}` **{}** [{}] - *{}*{}",
        index, id, item.title, duration, item.added_by, marker
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn guild() -> GuildId {
        GuildId::new(707620933841453186)
    }

    fn item(id: &str) -> MediaItem {
        MediaItem {
            id: id.into(),
            title: format!("title {}", id),
            source_url: format!("https://example.com/{}", id),
            duration: 3,
            added_by: "tester".into(),
            ..Default::default()
        }
    }

    fn ready_connection() -> (VoiceConnection, flume::Receiver<Bytes>) {
        let connection = VoiceConnection::new(guild(), 10);
        let (tx, rx) = flume::bounded(4);
        connection.attach(ChannelId::new(1), VoiceHandle::ready(tx));
        (connection, rx)
    }

    #[test]
    fn push_respects_cap_and_rejects_unplayable() {
        let connection = VoiceConnection::new(guild(), 2);
        assert!(connection.push(item("a")));
        assert!(!connection.push(MediaItem::default()));
        assert!(connection.push(item("b")));
        assert!(!connection.push(item("c")));

        let ids: Vec<_> = connection.queue().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn begin_next_waits_for_ready_transport() {
        let connection = VoiceConnection::new(guild(), 10);
        connection.push(item("a"));
        assert!(connection.begin_next().is_none());

        let (tx, _rx) = flume::bounded(1);
        let handle = VoiceHandle::new(tx);
        connection.attach(ChannelId::new(1), handle.clone());
        assert!(connection.begin_next().is_none());

        handle.set_ready(true);
        let next = connection.begin_next().unwrap();
        assert_eq!(next.item.id, "a");
        assert_eq!(next.item.remaining, 3);
        assert_eq!(connection.now_playing().unwrap().id, "a");
    }

    #[test]
    fn finish_removes_head_only_when_unchanged() {
        let (connection, _rx) = ready_connection();
        connection.push(item("a"));
        connection.push(item("b"));

        let next = connection.begin_next().unwrap();
        connection.finish(&next.item);
        assert!(connection.now_playing().is_none());
        assert_eq!(connection.queue()[0].id, "b");

        let next = connection.begin_next().unwrap();
        connection.clear();
        connection.push(item("c"));
        connection.finish(&next.item);
        assert_eq!(connection.queue()[0].id, "c");
    }

    #[test]
    fn release_keeps_head() {
        let (connection, _rx) = ready_connection();
        connection.push(item("a"));
        connection.push(item("b"));

        connection.begin_next().unwrap();
        connection.release();
        assert!(connection.now_playing().is_none());
        assert_eq!(connection.queue_len(), 2);
        assert_eq!(connection.begin_next().unwrap().item.id, "a");
    }

    #[test]
    fn progress_counts_delivered_frames() {
        let (connection, _rx) = ready_connection();
        connection.push(item("a"));
        connection.begin_next().unwrap();

        connection.record_progress(50);
        assert_eq!(connection.now_playing().unwrap().remaining, 2);
        connection.record_progress(500);
        assert_eq!(connection.now_playing().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let connection = Arc::new(VoiceConnection::new(guild(), 10));
        let config = Arc::new(EngineConfig::default());

        connection.start(config.clone()).unwrap();
        assert!(matches!(
            connection.start(config.clone()),
            Err(PlayerError::AlreadyRunning(_))
        ));
        assert!(connection.is_running());

        connection.stop().unwrap();
        assert!(!connection.is_running());
        assert!(matches!(connection.stop(), Err(PlayerError::NotRunning(_))));
        assert!(matches!(
            connection.send(Control::Skip).await,
            Err(PlayerError::NotRunning(_))
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let (connection, _rx) = ready_connection();
        connection.push(item("a"));
        connection.toggle_debug();

        let snapshot = connection.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = VoiceConnection::from_snapshot(serde_json::from_str(&json).unwrap(), 10);

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.channel_id(), Some(ChannelId::new(1)));
        assert!(!restored.is_running());
    }

    #[test]
    fn queue_line_format() {
        let mut entry = item("dQw4w9WgXcQ-and-more");
        entry.duration = 212;
        assert_eq!(
            format_queue_line(1, &entry, true),
            "`001:dQw4w9WgXcQ-and` **title dQw4w9WgXcQ-and-more** [3m 32s] - *tester* **(Now Playing)**"
        );
    }
}
