//! File-system output writer.
//!
//! Writes are atomic: bytes land in `{path}.tmp`, which is then renamed over
//! the target, so a rerun overwrites an artifact without leaving it truncated.

use crate::domain::ReportFormat;
use crate::ports::OutputWriter;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct FsOutputWriter;

impl FsOutputWriter {
    pub fn new() -> Self {
        Self
    }
}

/// Sibling temporary path used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` via a synced temporary file and a rename.
pub fn write_atomic(bytes: &[u8], path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}

impl OutputWriter for FsOutputWriter {
    fn write(&self, bytes: &[u8], path: &Path, format: ReportFormat) -> io::Result<()> {
        write_atomic(bytes, path)?;
        tracing::debug!(path = %path.display(), %format, bytes = bytes.len(), "artifact written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let writer = FsOutputWriter::new();

        writer.write(b"a;b\n1;2\n", &path, ReportFormat::CsvBr).unwrap();
        writer.write(b"a;b\n3;4\n", &path, ReportFormat::CsvBr).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "a;b\n3;4\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn temp_path_is_a_sibling() {
        assert_eq!(
            temp_path(Path::new("dir/report.pdf")),
            PathBuf::from("dir/report.pdf.tmp")
        );
    }
}
