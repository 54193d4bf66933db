use std::{fmt, process::Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{Locator, MediaItem};
use crate::{audio::connection::VoiceConnection, audio::pipeline::StageCommand, error::ResolutionError};

/// Runs the Resolver Stage (yt-dlp `-j` by default) and streams its records
/// into a connection's queue as they arrive.
#[derive(Debug, Clone)]
pub struct Resolver {
    command: StageCommand,
}

/// Outcome of one enqueue batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub added: usize,
    pub first_title: Option<String>,
    /// Parsed records refused because the queue was full.
    pub dropped: usize,
    /// Lines that were not usable records.
    pub malformed: usize,
}

impl EnqueueReport {
    fn record(&mut self, item: &MediaItem) {
        if self.added == 0 {
            self.first_title = Some(item.title.clone());
        }
        self.added += 1;
    }
}

impl fmt::Display for EnqueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first_title {
            Some(title) => {
                write!(f, "Added song: {}", title)?;
                if self.added > 1 {
                    write!(f, " and {} other.", self.added - 1)?;
                }
            }
            None => write!(f, "Nothing was added")?,
        }
        if self.dropped > 0 {
            write!(f, " The queue is full, {} left out.", self.dropped)?;
        }
        Ok(())
    }
}

impl Resolver {
    pub fn new(command: StageCommand) -> Self {
        Self { command }
    }

    /// Resolves `locator` and appends every usable record to the queue in
    /// the order the resolver emits them.
    ///
    /// Malformed lines are logged and skipped. Zero parsed records is a
    /// [`ResolutionError::NoResults`].
    pub async fn enqueue(
        &self,
        connection: &VoiceConnection,
        locator: &Locator,
        requester: &str,
    ) -> Result<EnqueueReport, ResolutionError> {
        let arg = locator.resolver_arg();
        let guild_id = connection.guild_id();
        debug!(%guild_id, %arg, "resolving");

        let mut cmd = self.command.command(Some(&arg), connection.is_debug());
        cmd.stdin(Stdio::null());
        let mut child = cmd.spawn().map_err(|source| ResolutionError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(ResolutionError::MissingStdout)?;

        let mut lines = BufReader::new(stdout).split(b'\n');
        let mut report = EnqueueReport::default();

        while let Some(line) = lines.next_segment().await.map_err(ResolutionError::Read)? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let mut item: MediaItem = match serde_json::from_slice(&line) {
                Ok(item) => item,
                Err(e) => {
                    warn!(%guild_id, "skipping unparsable resolver record: {}", e);
                    report.malformed += 1;
                    continue;
                }
            };
            if !item.is_playable() {
                warn!(%guild_id, id = %item.id, "skipping resolver record without source url");
                report.malformed += 1;
                continue;
            }

            item.added_by = requester.to_string();
            item.remaining = 0;
            if connection.push(item.clone()) {
                report.record(&item);
            } else {
                report.dropped += 1;
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => debug!(%guild_id, %status, "resolver exited with failure"),
            Ok(_) => {}
            Err(e) => debug!(%guild_id, "resolver wait failed: {}", e),
        }

        if report.added == 0 && report.dropped == 0 {
            return Err(ResolutionError::NoResults(arg));
        }

        info!(%guild_id, added = report.added, dropped = report.dropped, "enqueued");
        Ok(report)
    }
}
