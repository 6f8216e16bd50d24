//! Bulk upload from the local filesystem (`kb ingest <path>`).
//!
//! Walks a file or directory, keeps files whose extension is in
//! `storage.allowed_types` and that pass the include/exclude globs, and
//! uploads each one exactly as `POST /documents/upload` would. Processing
//! happens in the worker; `--wait` drains the queue in-process afterwards.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::documents::{self, UploadReceipt};
use crate::engine::Engine;

#[derive(Debug, Default)]
pub struct IngestReport {
    pub uploaded: Vec<UploadReceipt>,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub owner: Option<String>,
    pub follow_symlinks: bool,
}

/// Files under `root` eligible for upload, sorted by path.
pub fn collect_files(root: &Path, allowed_types: &[String], options: &IngestOptions) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Path does not exist: {}", root.display());
    }
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let include_set = if options.include.is_empty() {
        build_globset(&["**/*".to_string()])?
    } else {
        build_globset(&options.include)?
    };
    let mut excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    excludes.extend(options.exclude.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(options.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string();
        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !allowed_types.iter().any(|t| t.eq_ignore_ascii_case(&ext)) {
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();
    Ok(files)
}

/// Uploads every eligible file. Per-file failures are collected, not fatal.
pub async fn ingest_path(engine: &Engine, root: &Path, options: &IngestOptions) -> Result<IngestReport> {
    let files = collect_files(root, &engine.config.storage.allowed_types, options)?;
    let mut report = IngestReport::default();

    for path in files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                report.failed.push((path, e.to_string()));
                continue;
            }
        };
        if bytes.is_empty() {
            report.skipped += 1;
            continue;
        }

        match documents::upload(engine, &filename, &bytes, options.owner.clone()).await {
            Ok(receipt) if receipt.duplicate => report.duplicates += 1,
            Ok(receipt) => report.uploaded.push(receipt),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Upload failed");
                report.failed.push((path, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn allowed() -> Vec<String> {
        vec!["txt".into(), "md".into(), "pdf".into()]
    }

    #[test]
    fn collects_allowed_files_in_order() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("b.md"), "b").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::write(tmp.path().join("sub/c.TXT"), "c").unwrap();
        std::fs::write(tmp.path().join("tool.exe"), "x").unwrap();
        std::fs::write(tmp.path().join(".git/config.txt"), "x").unwrap();

        let files = collect_files(tmp.path(), &allowed(), &IngestOptions::default()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md", "sub/c.TXT"]);

        let only_md = IngestOptions {
            include: vec!["**/*.md".into()],
            ..IngestOptions::default()
        };
        assert_eq!(collect_files(tmp.path(), &allowed(), &only_md).unwrap().len(), 1);

        let no_sub = IngestOptions {
            exclude: vec!["sub/**".into()],
            ..IngestOptions::default()
        };
        assert_eq!(collect_files(tmp.path(), &allowed(), &no_sub).unwrap().len(), 2);
    }

    #[test]
    fn single_file_and_missing_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("one.txt");
        std::fs::write(&file, "x").unwrap();
        assert_eq!(collect_files(&file, &allowed(), &IngestOptions::default()).unwrap(), vec![file]);
        assert!(collect_files(&tmp.path().join("missing"), &allowed(), &IngestOptions::default()).is_err());
    }
}
