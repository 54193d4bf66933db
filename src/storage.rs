use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::audio::ConnectionSnapshot;

const SNAPSHOT_FILE: &str = "tunes.json";

/// Everything needed to bring the bot back to where it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub connections: Vec<ConnectionSnapshot>,
}

/// Snapshot file in the data directory.
pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;

        info!("📁 Storage at {}", data_dir.display());
        Ok(Self {
            path: data_dir.join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        info!(
            "📂 Loaded {} connections saved at {}",
            snapshot.connections.len(),
            snapshot.saved_at
        );
        Ok(Some(snapshot))
    }

    /// Writes to a sibling temp file, then renames over the real one.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, content)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        debug!(connections = snapshot.connections.len(), "💾 snapshot saved");
        Ok(())
    }
}
