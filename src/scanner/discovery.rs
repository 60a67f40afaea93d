use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("failed to read {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Build a predicate matching files by case-insensitive extension.
pub fn extension_matcher(extensions: &[String]) -> impl Fn(&Path) -> bool + Send + 'static {
    let extensions: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
    move |path: &Path| {
        path.extension()
            .map(|ext| {
                let ext_lower = ext.to_string_lossy().to_lowercase();
                extensions.iter().any(|e| *e == ext_lower)
            })
            .unwrap_or(false)
    }
}

/// Depth-first walk that yields matching file paths in batches of `batch_size`.
///
/// The last batch may be shorter. The iterator ends after the first traversal
/// error, which it yields.
pub struct BatchedPaths<F> {
    walker: walkdir::IntoIter,
    matches: F,
    batch_size: usize,
    failed: bool,
}

impl<F> BatchedPaths<F>
where
    F: Fn(&Path) -> bool,
{
    pub fn new(root: &Path, matches: F, batch_size: usize) -> Result<Self, ScanError> {
        if batch_size == 0 {
            return Err(ScanError::ZeroBatchSize);
        }

        Ok(Self {
            walker: WalkDir::new(root).follow_links(false).into_iter(),
            matches,
            batch_size,
            failed: false,
        })
    }
}

impl<F> Iterator for BatchedPaths<F>
where
    F: Fn(&Path) -> bool,
{
    type Item = Result<Vec<PathBuf>, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_size);

        for entry in self.walker.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.failed = true;
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    return Some(Err(ScanError::Walk { path, source: e }));
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if (self.matches)(entry.path()) {
                tracing::trace!(path = %entry.path().display(), "matching");
                batch.push(entry.into_path());
                if batch.len() == self.batch_size {
                    return Some(Ok(batch));
                }
            } else {
                tracing::trace!(path = %entry.path().display(), "non matching");
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

/// Walk `root` on a blocking thread and stream batches of matching paths.
///
/// The channel holds a single batch, so the walk pauses until the consumer
/// has taken the previous one.
pub fn scan_in_batches<F>(
    root: PathBuf,
    matches: F,
    batch_size: usize,
) -> mpsc::Receiver<Result<Vec<PathBuf>, ScanError>>
where
    F: Fn(&Path) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::task::spawn_blocking(move || {
        let batches = match BatchedPaths::new(&root, matches, batch_size) {
            Ok(batches) => batches,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        for batch in batches {
            if tx.blocking_send(batch).is_err() {
                // Consumer went away.
                break;
            }
        }
    });

    rx
}
