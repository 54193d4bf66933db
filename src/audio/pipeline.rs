//! Three-stage external process pipeline for a single [`MediaItem`]:
//! fetch (yt-dlp) -> transcode (ffmpeg, s16le 48 kHz stereo) -> encode (dca).
//!
//! Stages are joined with OS pipes; only the encoder's stdout is read by us,
//! through a [`FrameReader`]. Every child is spawned with `kill_on_drop`, so
//! dropping a [`Pipeline`] tears the whole chain down.

use std::{fmt, process::Stdio};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use super::frames::FrameReader;
use crate::{error::PipelineError, sources::MediaItem};

/// Which external process a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Transcode,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Transcode => "transcode",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// An external program plus its argument template.
///
/// An argument containing `{url}` has the locator substituted into it; when
/// no argument does, the locator is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub const URL_PLACEHOLDER: &'static str = "{url}";

    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Whitespace-separated template, e.g. `yt-dlp -i -j {url}`.
    pub fn parse(template: &str) -> Option<Self> {
        let mut parts = template.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// Builds the command with stdout piped and stderr forwarded only in
    /// debug mode.
    pub fn command(&self, url: Option<&str>, debug: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        let mut substituted = false;

        for arg in &self.args {
            match url {
                Some(url) if arg.contains(Self::URL_PLACEHOLDER) => {
                    cmd.arg(arg.replace(Self::URL_PLACEHOLDER, url));
                    substituted = true;
                }
                _ => {
                    cmd.arg(arg);
                }
            }
        }

        if let (Some(url), false) = (url, substituted) {
            cmd.arg(url);
        }

        cmd.stdout(Stdio::piped())
            .stderr(if debug { Stdio::inherit() } else { Stdio::null() })
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The three playback stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStages {
    pub fetch: StageCommand,
    pub transcode: StageCommand,
    pub encode: StageCommand,
}

impl Default for PipelineStages {
    fn default() -> Self {
        Self {
            fetch: StageCommand::new(
                "yt-dlp",
                ["-v", "-f", "bestaudio", "-o", "-", StageCommand::URL_PLACEHOLDER],
            ),
            transcode: StageCommand::new(
                "ffmpeg",
                [
                    "-i", "pipe:0", "-f", "s16le", "-ar", "48000", "-ac", "2", "-af",
                    "volume=0.5", "pipe:1",
                ],
            ),
            encode: StageCommand::new("dca", Vec::<String>::new()),
        }
    }
}

/// A running fetch -> transcode -> encode chain.
pub struct Pipeline {
    // Held only so the children live (and die) with the pipeline.
    _children: [Child; 3],
    frames: FrameReader<ChildStdout>,
}

impl Pipeline {
    /// Starts each stage before wiring its output into the next one.
    /// Any failure drops (and so kills) the stages already started.
    pub fn spawn(
        stages: &PipelineStages,
        item: &MediaItem,
        debug: bool,
    ) -> Result<Self, PipelineError> {
        let mut fetch = stages.fetch.command(Some(&item.source_url), debug);
        fetch.stdin(Stdio::null());
        let mut fetch = spawn_stage(fetch, Stage::Fetch)?;
        let fetch_out = pipe_out(&mut fetch, Stage::Fetch)?;

        let mut transcode = stages.transcode.command(None, debug);
        transcode.stdin(fetch_out);
        let mut transcode = spawn_stage(transcode, Stage::Transcode)?;
        let transcode_out = pipe_out(&mut transcode, Stage::Transcode)?;

        let mut encode = stages.encode.command(None, debug);
        encode.stdin(transcode_out);
        let mut encode = spawn_stage(encode, Stage::Encode)?;
        let encode_out = encode
            .stdout
            .take()
            .ok_or(PipelineError::MissingStdout(Stage::Encode))?;

        debug!(id = %item.id, "pipeline started");

        Ok(Self {
            _children: [fetch, transcode, encode],
            frames: FrameReader::new(encode_out),
        })
    }

    pub fn frames(&mut self) -> &mut FrameReader<ChildStdout> {
        &mut self.frames
    }
}

fn spawn_stage(mut cmd: Command, stage: Stage) -> Result<Child, PipelineError> {
    cmd.spawn()
        .map_err(|source| PipelineError::Spawn { stage, source })
}

fn pipe_out(child: &mut Child, stage: Stage) -> Result<Stdio, PipelineError> {
    let stdout = child
        .stdout
        .take()
        .ok_or(PipelineError::MissingStdout(stage))?;
    stdout
        .try_into()
        .map_err(|source| PipelineError::Wire { stage, source })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn item(url: &str) -> MediaItem {
        MediaItem {
            id: "t".into(),
            source_url: url.into(),
            ..Default::default()
        }
    }

    fn passthrough_stages(fetch: StageCommand) -> PipelineStages {
        PipelineStages {
            fetch,
            transcode: StageCommand::new("cat", Vec::<String>::new()),
            encode: StageCommand::new("cat", Vec::<String>::new()),
        }
    }

    #[test]
    fn url_substitution_and_append() {
        let templated = StageCommand::parse("yt-dlp -i -j {url}").unwrap();
        let cmd = templated.command(Some("https://x"), false);
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-i", "-j", "https://x"]);

        let bare = StageCommand::parse("dca").unwrap();
        let args: Vec<_> = bare
            .command(Some("https://y"), false)
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["https://y"]);

        assert!(StageCommand::parse("   ").is_none());
    }

    #[tokio::test]
    async fn frames_flow_through_all_stages() {
        // Octal escapes: two frames, "abc" and "de".
        let fetch = StageCommand::new("sh", ["-c", "printf '\\003\\000abc\\002\\000de'", "fetch"]);
        let mut pipeline = Pipeline::spawn(&passthrough_stages(fetch), &item("ignored"), false).unwrap();

        let frames = pipeline.frames();
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"de"));
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn source_url_reaches_fetch_stage() {
        // The fetch stage echoes its last argument as a single frame payload.
        let fetch = StageCommand::new(
            "sh",
            ["-c", "printf '\\003\\000%s' \"$1\"", "fetch", StageCommand::URL_PLACEHOLDER],
        );
        let mut pipeline = Pipeline::spawn(&passthrough_stages(fetch), &item("xyz"), false).unwrap();

        assert_eq!(
            pipeline.frames().next_frame().await.unwrap().unwrap(),
            Bytes::from_static(b"xyz")
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut stages = passthrough_stages(StageCommand::new("cat", Vec::<String>::new()));
        stages.transcode = StageCommand::new("/nonexistent/ffmpeg-for-tests", Vec::<String>::new());

        match Pipeline::spawn(&stages, &item("x"), false) {
            Err(PipelineError::Spawn { stage, .. }) => assert_eq!(stage, Stage::Transcode),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("pipeline should not start"),
        }
    }
}
