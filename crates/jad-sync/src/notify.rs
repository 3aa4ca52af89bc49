//! Markdown digest notifier: writes each digest to the reports directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use jad_core::StoredRecord;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::delivery::{NotificationError, Notifier};

pub fn digest_subject(count: usize) -> String {
    match count {
        1 => "1 new job posting".to_string(),
        n => format!("{n} new job postings"),
    }
}

/// Render records (already oldest first) grouped by source in order of first
/// appearance.
pub fn render_digest_markdown(records: &[StoredRecord]) -> String {
    let mut groups: Vec<(&str, Vec<&StoredRecord>)> = Vec::new();
    for record in records {
        let source_id = record.posting.source_id.as_str();
        match groups.iter_mut().find(|(id, _)| *id == source_id) {
            Some((_, members)) => members.push(record),
            None => groups.push((source_id, vec![record])),
        }
    }

    let mut out = format!("# {}\n", digest_subject(records.len()));
    for (source_id, members) in groups {
        out.push_str(&format!("\n## {source_id}\n\n"));
        for record in members {
            let posting = &record.posting;
            out.push_str(&format!(
                "- {} at {} ({})\n  {}\n",
                posting.title, posting.company, posting.location, posting.url
            ));
            if let Some(date) = posting.posted_at {
                out.push_str(&format!("  posted {date}\n"));
            }
        }
    }
    out
}

/// Write through a sibling temp file, leaving nothing behind on failure.
async fn write_atomically(final_path: &Path, contents: String) -> std::io::Result<()> {
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));

    let written = match fs::write(&tmp_path, contents).await {
        Ok(()) => fs::rename(&tmp_path, final_path).await,
        Err(err) => Err(err),
    };
    if written.is_err() {
        if let Err(cleanup) = fs::remove_file(&tmp_path).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %cleanup, "could not remove temp digest");
            }
        }
    }
    written
}

#[derive(Debug, Clone)]
pub struct MarkdownDigestNotifier {
    reports_dir: PathBuf,
}

impl MarkdownDigestNotifier {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }
}

#[async_trait]
impl Notifier for MarkdownDigestNotifier {
    async fn send_digest(&self, records: &[StoredRecord]) -> Result<(), NotificationError> {
        fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|err| NotificationError::Transport(err.to_string()))?;
        let name = format!("digest_{}.md", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let final_path = self.reports_dir.join(name);

        write_atomically(&final_path, render_digest_markdown(records))
            .await
            .map_err(|err| NotificationError::Transport(err.to_string()))?;

        info!(path = %final_path.display(), count = records.len(), "digest written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn atomic_write_replaces_nothing_but_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("digest.md");

        write_atomically(&target, "# 1 new job posting\n".to_string()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "# 1 new job posting\n");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_rename_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("digest.md");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("occupied"), "x").unwrap();

        assert!(write_atomically(&target, "body".to_string()).await.is_err());
        assert!(leftovers(dir.path()).is_empty());
        assert!(target.is_dir());
    }

    #[test]
    fn subject_is_singular_for_one_posting() {
        assert_eq!(digest_subject(1), "1 new job posting");
        assert_eq!(digest_subject(3), "3 new job postings");
    }
}
