//! Markdown notes of a vault directory as a [`SourceRegistry`]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use signalforge_sdk::{SourceItem, SourceRegistry};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: &[&str] = &[".obsidian", "node_modules"];

pub struct VaultRegistry {
    vault_dir: PathBuf,
    /// Generated output that must not be scanned for intents
    excluded: Vec<PathBuf>,
}

impl VaultRegistry {
    pub fn new(vault_dir: impl Into<PathBuf>) -> Self {
        Self {
            vault_dir: vault_dir.into(),
            excluded: Vec::new(),
        }
    }

    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    fn is_skipped(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        entry.file_type().is_dir()
            && (SKIPPED_DIRS.contains(&name.as_ref())
                || self.excluded.iter().any(|dir| entry.path() == dir.as_path()))
    }

    /// `/`-separated path relative to the vault
    fn id_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.vault_dir).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn note_paths(&self) -> Vec<(String, PathBuf)> {
        let mut notes: Vec<(String, PathBuf)> = WalkDir::new(&self.vault_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_skipped(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
            .filter_map(|e| {
                let id = self.id_for(e.path())?;
                Some((id, e.into_path()))
            })
            .collect();
        notes.sort_by(|a, b| a.0.cmp(&b.0));
        notes
    }
}

fn modified_ms(modified: SystemTime) -> i64 {
    DateTime::<Utc>::from(modified).timestamp_millis()
}

#[async_trait]
impl SourceRegistry for VaultRegistry {
    async fn list(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceItem>> {
        let since_ms = since.map(|s| s.timestamp_millis());
        let mut items = Vec::new();

        for (id, path) in self.note_paths() {
            let metadata = tokio::fs::metadata(&path)
                .await
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            let modified_ms = modified_ms(
                metadata
                    .modified()
                    .with_context(|| format!("No modification time for {}", path.display()))?,
            );
            if since_ms.is_some_and(|since| modified_ms < since) {
                continue;
            }

            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            items.push(SourceItem {
                id,
                path,
                content,
                modified_ms,
            });
        }

        Ok(items)
    }

    async fn version(&self, id: &str) -> Result<Option<i64>> {
        let path = self.vault_dir.join(id);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(modified_ms(metadata.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        }
    }
}
