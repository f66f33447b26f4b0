//! Filesystem library scanner
//!
//! Walks the media directory, registers unknown video files as scenes,
//! and pushes import events into the trigger engine.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::jobs::TriggerEngine;
use crate::scenes::SqliteSceneRepo;
use crate::traits::{LibraryScanner, ScanSummary};
use crate::Result;

const VIDEO_EXTENSIONS: [&str; 8] = ["mp4", "mkv", "webm", "avi", "mov", "m4v", "ts", "wmv"];

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Scanner over a single library root
pub struct FsLibraryScanner {
    root: PathBuf,
    scenes: SqliteSceneRepo,
    engine: Arc<TriggerEngine>,
}

impl FsLibraryScanner {
    pub fn new(root: impl Into<PathBuf>, scenes: SqliteSceneRepo, engine: Arc<TriggerEngine>) -> Self {
        Self {
            root: root.into(),
            scenes,
            engine,
        }
    }

    /// Depth-first walk collecting video files. Unreadable directories
    /// are skipped, not fatal.
    async fn collect_files(&self) -> Result<(Vec<PathBuf>, usize)> {
        let mut files = Vec::new();
        let mut errors = 0;
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot read directory: path={}, error={}", dir.display(), e);
                    errors += 1;
                    continue;
                }
            };

            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        match entry.file_type().await {
                            Ok(file_type) if file_type.is_dir() => stack.push(path),
                            Ok(file_type) if file_type.is_file() && is_video(&path) => {
                                files.push(path)
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("Cannot stat entry: path={}, error={}", path.display(), e);
                                errors += 1;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Directory walk error: path={}, error={}", dir.display(), e);
                        errors += 1;
                        break;
                    }
                }
            }
        }

        Ok((files, errors))
    }
}

#[async_trait]
impl LibraryScanner for FsLibraryScanner {
    async fn scan(&self) -> Result<ScanSummary> {
        info!("Scanning library: root={}", self.root.display());
        let (files, walk_errors) = self.collect_files().await?;

        let mut summary = ScanSummary {
            discovered: files.len(),
            imported: 0,
            errors: walk_errors,
        };

        for path in files {
            match self.scenes.register(&path).await {
                Ok((scene_id, true)) => {
                    summary.imported += 1;
                    if let Err(e) = self.engine.on_import(scene_id).await {
                        warn!("Import trigger failed: scene={}, error={}", scene_id, e);
                        summary.errors += 1;
                    }
                }
                Ok((_, false)) => {
                    debug!("Already registered: path={}", path.display());
                }
                Err(e) => {
                    warn!("Failed to register: path={}, error={}", path.display(), e);
                    summary.errors += 1;
                }
            }
        }

        info!(
            "Scan finished: discovered={}, imported={}, errors={}",
            summary.discovered, summary.imported, summary.errors
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_extension_filter() {
        assert!(is_video(Path::new("/m/a.mp4")));
        assert!(is_video(Path::new("/m/a.MKV")));
        assert!(!is_video(Path::new("/m/a.srt")));
        assert!(!is_video(Path::new("/m/a.jpg")));
        assert!(!is_video(Path::new("/m/noext")));
    }
}
