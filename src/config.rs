use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

use crate::audio::pipeline::{PipelineStages, StageCommand};

/// Everything the playback engine needs: stage commands and timings.
///
/// Kept apart from [`Config`] so the engine can be driven without a bot
/// token or a data directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub resolver: StageCommand,
    pub stages: PipelineStages,
    pub max_queue_size: usize,
    /// Backoff while waiting for the queue or the transport.
    pub poll_interval: Duration,
    /// Longest wait for the transport to accept one frame.
    pub frame_send_timeout: Duration,
    /// Longest wait for the pipeline to produce one frame. `None` waits forever.
    pub stage_read_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolver: StageCommand::new("yt-dlp", ["-i", "-j", StageCommand::URL_PLACEHOLDER]),
            stages: PipelineStages::default(),
            max_queue_size: 1000,
            poll_interval: Duration::from_millis(1000),
            frame_send_timeout: Duration::from_millis(5000),
            stage_read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Paths
    pub data_dir: PathBuf,

    // Stages
    pub resolver_command: StageCommand,
    pub fetch_command: StageCommand,
    pub transcode_command: StageCommand,
    pub encode_command: StageCommand,

    // Playback
    pub max_queue_size: usize,
    pub poll_interval_ms: u64,
    pub frame_send_timeout_ms: u64,
    pub stage_read_timeout_secs: u64,
    pub frame_buffer: usize,

    // Persistence
    pub save_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Builds a config from any key lookup; unset keys take their defaults.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let command = |key: &str, default: &str| -> Result<StageCommand> {
            StageCommand::parse(&var(key, default))
                .with_context(|| format!("{} must name a program", key))
        };

        Ok(Self {
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,

            data_dir: var("DATA_DIR", "./data").into(),

            resolver_command: command("RESOLVER_COMMAND", "yt-dlp -i -j {url}")?,
            fetch_command: command("FETCH_COMMAND", "yt-dlp -v -f bestaudio -o - {url}")?,
            transcode_command: command(
                "TRANSCODE_COMMAND",
                "ffmpeg -i pipe:0 -f s16le -ar 48000 -ac 2 -af volume=0.5 pipe:1",
            )?,
            encode_command: command("ENCODE_COMMAND", "dca")?,

            max_queue_size: var("MAX_QUEUE_SIZE", "1000")
                .parse()
                .context("MAX_QUEUE_SIZE")?,
            poll_interval_ms: var("POLL_INTERVAL_MS", "1000")
                .parse()
                .context("POLL_INTERVAL_MS")?,
            frame_send_timeout_ms: var("FRAME_SEND_TIMEOUT_MS", "5000")
                .parse()
                .context("FRAME_SEND_TIMEOUT_MS")?,
            stage_read_timeout_secs: var("STAGE_READ_TIMEOUT_SECS", "30")
                .parse()
                .context("STAGE_READ_TIMEOUT_SECS")?,
            frame_buffer: var("FRAME_BUFFER", "50")
                .parse()
                .context("FRAME_BUFFER")?,

            save_interval_secs: var("SAVE_INTERVAL_SECS", "300")
                .parse()
                .context("SAVE_INTERVAL_SECS")?,
        })
    }

    /// Sanity checks that would otherwise surface as a stuck or busy loop.
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN is empty");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than 0");
        }

        if self.frame_send_timeout_ms == 0 {
            anyhow::bail!("Frame send timeout must be greater than 0");
        }

        if self.frame_buffer == 0 {
            anyhow::bail!("Frame buffer must hold at least one frame");
        }

        if self.save_interval_secs == 0 {
            anyhow::bail!("Save interval must be greater than 0");
        }

        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            resolver: self.resolver_command.clone(),
            stages: PipelineStages {
                fetch: self.fetch_command.clone(),
                transcode: self.transcode_command.clone(),
                encode: self.encode_command.clone(),
            },
            max_queue_size: self.max_queue_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            frame_send_timeout: Duration::from_millis(self.frame_send_timeout_ms),
            stage_read_timeout: match self.stage_read_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Data: {}\n  \
            Resolver: {}\n  \
            Pipeline: {} | {} | {}\n  \
            Limits: {} queue, {} frame buffer\n  \
            Timing: {}ms poll, {}ms send timeout, {}s read timeout, {}s save interval",
            self.data_dir.display(),
            self.resolver_command,
            self.fetch_command,
            self.transcode_command,
            self.encode_command,
            self.max_queue_size,
            self.frame_buffer,
            self.poll_interval_ms,
            self.frame_send_timeout_ms,
            self.stage_read_timeout_secs,
            self.save_interval_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let config = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t")])).unwrap();
        config.validate().unwrap();

        let engine = config.engine();
        let defaults = EngineConfig::default();
        assert_eq!(engine.resolver, defaults.resolver);
        assert_eq!(engine.stages, defaults.stages);
        assert_eq!(engine.max_queue_size, defaults.max_queue_size);
        assert_eq!(engine.poll_interval, defaults.poll_interval);
        assert_eq!(engine.frame_send_timeout, defaults.frame_send_timeout);
        assert_eq!(engine.stage_read_timeout, defaults.stage_read_timeout);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn token_is_required_and_hidden() {
        assert!(Config::from_lookup(lookup(&[])).is_err());

        let config = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "very-secret")])).unwrap();
        assert!(!config.summary().contains("very-secret"));
    }

    #[test]
    fn overrides_and_disabled_watchdog() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("ENCODE_COMMAND", "opusenc --raw -"),
            ("STAGE_READ_TIMEOUT_SECS", "0"),
            ("MAX_QUEUE_SIZE", "5"),
        ]))
        .unwrap();

        let engine = config.engine();
        assert_eq!(engine.stages.encode.program, "opusenc");
        assert_eq!(engine.stages.encode.args, vec!["--raw", "-"]);
        assert_eq!(engine.stage_read_timeout, None);
        assert_eq!(engine.max_queue_size, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t"), ("MAX_QUEUE_SIZE", "lots")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t"), ("FETCH_COMMAND", "  ")])).is_err());

        let config = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t"), ("FRAME_BUFFER", "0")])).unwrap();
        assert!(config.validate().is_err());
    }
}
