//! What a run leaves behind: a count, an HTML page or a folder of
//! representative images.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::batch::{run_isolated, ItemOutcome};
use crate::config::OutputMode;
use crate::db::{DatabaseBackend, GroupWithImages, ImageRecord};

pub const REPORT_FILE: &str = "index.html";

/// Number of images the store holds.
pub fn dry_run_stats<B: DatabaseBackend + ?Sized>(store: &B) -> Result<usize> {
    let count = store.count_images()?;
    info!(count, "images would be processed");
    Ok(count)
}

/// Write `index.html` into `output_dir` showing the largest image of every group.
pub fn write_html_report(
    groups: &[GroupWithImages],
    source_dir: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let report_path = output_dir.join(REPORT_FILE);

    let mut html = String::new();

    html.push_str(r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Image Results</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            margin: 0 auto;
            padding: 20px;
            background: #1a1a1a;
            color: #e0e0e0;
        }
        h2 {
            color: #4fc3f7;
            font-size: 16px;
        }
        .group {
            display: flex;
            flex-wrap: wrap;
        }
        .group article {
            margin: 20px;
        }
        .group img {
            max-width: 256px;
            height: auto;
        }
        .group b, .group .path {
            display: block;
        }
        .group .path {
            font-size: 12px;
            color: #888;
            word-break: break-all;
        }
    </style>
</head>
<body>
"#);

    html.push_str(&format!(
        r#"    <p><strong>Groups:</strong> {}</p>
"#,
        groups.len()
    ));

    for group in groups {
        let Some(image) = group.largest_image() else {
            continue;
        };
        let shown = Path::new(&image.path)
            .strip_prefix(source_dir)
            .unwrap_or_else(|_| Path::new(&image.path));

        html.push_str(&format!(
            r#"    <section id="group-{id}">
        <h2>{id} ({count})</h2>
        <div class="group">
            <article>
                <img src="{src}" />
                <b>{size}</b>
                <span class="path">{path}</span>
            </article>
        </div>
    </section>
"#,
            id = group.group.id,
            count = group.images.len(),
            src = file_url(&image.path),
            size = format_size(image.bytes),
            path = html_escape(&shown.to_string_lossy()),
        ));
    }

    html.push_str(r#"</body>
</html>
"#);

    let mut file = File::create(&report_path)
        .with_context(|| format!("Failed to create {}", report_path.display()))?;
    file.write_all(html.as_bytes())?;

    info!(path = %report_path.display(), groups = groups.len(), "wrote report");
    Ok(report_path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub folder: PathBuf,
    pub copied: usize,
    pub failed: usize,
}

/// Copy (or move) the largest image of each group into a new timestamped
/// folder under `output_dir`, named `<group id><extension>`.
///
/// Groups are handled `batch_size` at a time; one group failing does not stop
/// the others.
pub async fn copy_representatives(
    groups: Vec<GroupWithImages>,
    output_dir: &Path,
    mode: OutputMode,
    batch_size: usize,
) -> Result<CopyReport> {
    let folder_name = chrono::Utc::now()
        .format("%Y-%m-%dT%H-%M-%S-%3fZ")
        .to_string();
    let folder = output_dir.join(folder_name);
    tokio::fs::create_dir_all(&folder)
        .await
        .with_context(|| format!("Failed to create {}", folder.display()))?;

    let picks: Vec<(i64, ImageRecord)> = groups
        .into_iter()
        .filter_map(|group| {
            let id = group.group.id;
            group.largest_image().cloned().map(|image| (id, image))
        })
        .collect();

    let mut report = CopyReport {
        folder: folder.clone(),
        copied: 0,
        failed: 0,
    };

    let mut remaining = picks.into_iter().peekable();
    while remaining.peek().is_some() {
        let batch: Vec<(i64, ImageRecord)> = remaining.by_ref().take(batch_size.max(1)).collect();
        let outcomes = run_isolated(batch, |(group_id, image)| {
            place_file(group_id, image, &folder, mode)
        })
        .await;

        for outcome in outcomes {
            match outcome {
                ItemOutcome::Done(()) => report.copied += 1,
                _ => report.failed += 1,
            }
        }
    }

    info!(
        folder = %report.folder.display(),
        copied = report.copied,
        failed = report.failed,
        "representatives written"
    );
    Ok(report)
}

async fn place_file(
    group_id: i64,
    image: ImageRecord,
    folder: &Path,
    mode: OutputMode,
) -> Result<Option<()>> {
    let source = PathBuf::from(&image.path);
    let mut name = group_id.to_string();
    if let Some(ext) = source.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    let dest = folder.join(name);

    debug!(from = %source.display(), to = %dest.display(), "placing file");
    match mode {
        OutputMode::Move => {
            // rename fails across filesystems
            if tokio::fs::rename(&source, &dest).await.is_err() {
                tokio::fs::copy(&source, &dest)
                    .await
                    .with_context(|| format!("Failed to copy {}", source.display()))?;
                tokio::fs::remove_file(&source)
                    .await
                    .with_context(|| format!("Failed to remove {}", source.display()))?;
            }
        }
        OutputMode::Copy | OutputMode::Page => {
            tokio::fs::copy(&source, &dest)
                .await
                .with_context(|| format!("Failed to copy {}", source.display()))?;
        }
    }

    Ok(Some(()))
}

/// `file://` URL for an absolute path. Every byte outside the unreserved set
/// and `/` is percent-encoded, so `#`, `?` and `%` stay part of the path.
fn file_url(path: &str) -> String {
    let mut url = String::from(if path.starts_with('/') { "file://" } else { "file:///" });
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                url.push(byte as char)
            }
            _ => url.push_str(&format!("%{:02X}", byte)),
        }
    }
    url
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.1} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
