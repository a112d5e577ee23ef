use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::collaborators::FileExporter;

pub const DEFAULT_FILE_NAME: &str = "document.txt";

/// Writes exported text files into one directory. Existing files are never
/// overwritten; a numeric suffix is added instead.
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn unique_path(&self, file_name: &str) -> PathBuf {
        let candidate = self.dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }

        let (stem, ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (file_name, None),
        };
        (1..)
            .map(|n| match ext {
                Some(ext) => self.dir.join(format!("{} ({}).{}", stem, n, ext)),
                None => self.dir.join(format!("{} ({})", stem, n)),
            })
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

/// Reduce a model-supplied name to a safe single path component.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();

    if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned.chars().take(120).collect()
    }
}

impl FileExporter for DirectoryExporter {
    fn export(&self, file_name: &str, body: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create export dir {:?}", self.dir))?;

        let path = self.unique_path(&sanitize_file_name(file_name));
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write exported file {:?}", path))?;
        tracing::info!("Exported text file to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_paths_and_reserved_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\temp\\notes.md"), "notes.md");
        assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
        assert_eq!(sanitize_file_name("  "), DEFAULT_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), DEFAULT_FILE_NAME);
    }

    #[test]
    fn export_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = DirectoryExporter::new(dir.path().join("exports"));

        let first = exporter.export("notes.txt", "one").unwrap();
        let second = exporter.export("notes.txt", "two").unwrap();

        assert_ne!(first, second);
        assert_eq!(second.file_name().unwrap(), "notes (1).txt");
        assert_eq!(std::fs::read_to_string(first).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(second).unwrap(), "two");
    }
}
