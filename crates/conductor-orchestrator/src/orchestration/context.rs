// Context externalization for oversized tool output
//
// Large successful tool results are written to run-scoped files under the
// storage root and replaced in the conversation by a compact reference with a
// short preview. Error results always stay inline.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use conductor_abstraction::{ChatMessage, Role};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ContextConfig;
use super::execution::truncate_chars;
use super::tool::ToolResult;

/// Offloads oversized tool results to files and tracks them per run
#[derive(Debug)]
pub struct ContextExternalizer {
    config: ContextConfig,
    tracked: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl ContextExternalizer {
    /// Create a manager writing under `config.storage_root`
    pub fn new(config: ContextConfig) -> Self {
        Self { config, tracked: Mutex::new(HashMap::new()) }
    }

    /// Externalization threshold in characters
    pub fn threshold(&self) -> usize {
        self.config.threshold_chars
    }

    /// Directory externalized content is written under
    pub fn storage_root(&self) -> &Path {
        &self.config.storage_root
    }

    /// Compact one result
    ///
    /// Error results and results at or below the threshold pass through unchanged.
    /// If writing fails or the target path would leave the storage root, the
    /// original result is returned.
    pub async fn compact(&self, run_id: &str, result: ToolResult) -> ToolResult {
        if result.is_error || result.content.chars().count() <= self.config.threshold_chars {
            return result;
        }

        match self.externalize(run_id, &result.content).await {
            Some(reference) => ToolResult { content: reference, ..result },
            None => result,
        }
    }

    /// Apply the same rule to every tool turn of an existing conversation
    pub async fn compact_all(
        &self,
        run_id: &str,
        messages: &[ChatMessage],
        threshold: Option<usize>,
    ) -> Vec<ChatMessage> {
        let threshold = threshold.unwrap_or(self.config.threshold_chars);
        let mut compacted = Vec::with_capacity(messages.len());

        for message in messages {
            let oversized = message.role == Role::Tool
                && !message.is_error
                && message.content.chars().count() > threshold;
            if oversized {
                if let Some(reference) = self.externalize(run_id, &message.content).await {
                    compacted.push(ChatMessage { content: reference, ..message.clone() });
                    continue;
                }
            }
            compacted.push(message.clone());
        }

        compacted
    }

    /// Delete every location tracked for `run_id` and forget them
    ///
    /// Returns how many files were actually removed. Files already gone are skipped.
    pub async fn cleanup(&self, run_id: &str) -> usize {
        let paths = self.lock().remove(run_id).unwrap_or_default();
        let mut removed = 0;

        for path in &paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(run_id = %run_id, path = %path.display(), error = %e, "Failed to remove externalized content"),
            }
        }

        if !paths.is_empty() {
            debug!(run_id = %run_id, tracked = paths.len(), removed, "Cleaned up externalized content");
        }
        removed
    }

    /// Clean up every tracked run
    pub async fn cleanup_all(&self) -> usize {
        let run_ids: Vec<String> = self.lock().keys().cloned().collect();
        let mut removed = 0;
        for run_id in run_ids {
            removed += self.cleanup(&run_id).await;
        }
        removed
    }

    /// Total bytes currently stored for `run_id`; missing files are skipped
    pub async fn size_of(&self, run_id: &str) -> u64 {
        let paths = self.tracked_paths(run_id);
        let mut total = 0;
        for path in paths {
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                total += metadata.len();
            }
        }
        total
    }

    /// Locations tracked for `run_id`
    pub fn tracked_paths(&self, run_id: &str) -> Vec<PathBuf> {
        self.lock().get(run_id).cloned().unwrap_or_default()
    }

    async fn externalize(&self, run_id: &str, content: &str) -> Option<String> {
        let suffix = Uuid::new_v4().simple().to_string();
        let file_name = format!("{run_id}-{}.txt", &suffix[..12]);

        let Some(path) = self.resolve_in_root(&file_name).await else {
            warn!(run_id = %run_id, file_name = %file_name, "Externalization path escapes storage root; keeping content inline");
            return None;
        };

        if let Err(e) = tokio::fs::write(&path, content).await {
            warn!(run_id = %run_id, path = %path.display(), error = %e, "Failed to externalize tool output");
            return None;
        }

        self.lock().entry(run_id.to_string()).or_default().push(path.clone());
        info!(run_id = %run_id, path = %path.display(), bytes = content.len(), "Externalized tool output");

        Some(self.reference_for(&path, content))
    }

    async fn resolve_in_root(&self, file_name: &str) -> Option<PathBuf> {
        let mut components = Path::new(file_name).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return None;
        }

        let root = &self.config.storage_root;
        if let Err(e) = tokio::fs::create_dir_all(root).await {
            warn!(root = %root.display(), error = %e, "Failed to create context storage root");
            return None;
        }
        let canonical_root = tokio::fs::canonicalize(root).await.ok()?;
        let candidate = canonical_root.join(file_name);

        (candidate.parent() == Some(canonical_root.as_path())).then_some(candidate)
    }

    fn reference_for(&self, path: &Path, content: &str) -> String {
        let (preview, omitted) = truncate_chars(content, self.config.preview_chars);
        let ellipsis = if omitted > 0 { "\n..." } else { "" };
        format!(
            "[Tool output externalized]\n\
             Location: {}\n\
             Size: {} bytes, {} lines\n\
             Preview:\n{}{}\n\
             Use a file-reading tool (e.g. read_file) with the location above to retrieve the full content.",
            path.display(),
            content.len(),
            content.lines().count(),
            preview,
            ellipsis
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<PathBuf>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
