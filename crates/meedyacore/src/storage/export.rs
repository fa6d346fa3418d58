//! Portable job lists.
//!
//! An export file is a JSON array of `{ "urls": [...], "options": {...} }`
//! records, one per job that still had unfinished work. Status and progress
//! are not exported; importing re-expands each record with the settings in
//! effect at import time.

use std::path::Path;

use crate::core::error::{AppError, AppResult};
use crate::download::expander::DownloadJob;
use crate::storage::snapshot::write_json_atomic;

/// Write `jobs` to `path`, replacing it atomically. Returns the record count.
pub fn write_jobs(path: &Path, jobs: &[DownloadJob]) -> AppResult<usize> {
    write_json_atomic(path, &jobs)?;
    log::info!("Exported {} job(s) to {}", jobs.len(), path.display());
    Ok(jobs.len())
}

/// Parse an export file. Any malformed record rejects the whole file.
pub fn read_jobs(path: &Path) -> AppResult<Vec<DownloadJob>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::UserInput(format!("cannot read {}: {}", path.display(), e)))?;
    parse_jobs(&raw)
}

/// Parse the contents of an export file.
pub fn parse_jobs(raw: &str) -> AppResult<Vec<DownloadJob>> {
    serde_json::from_str(raw).map_err(|e| AppError::UserInput(format!("malformed export file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::codec::SongCodec;
    use crate::download::options::DownloadOptions;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let jobs = vec![
            DownloadJob::new(["https://music.apple.com/us/album/a/1"]),
            DownloadJob::new(["https://music.apple.com/us/song/b/2"]).with_options(DownloadOptions {
                song_codec: Some(SongCodec::Atmos),
                ..Default::default()
            }),
        ];

        assert_eq!(write_jobs(&path, &jobs).unwrap(), 2);
        assert_eq!(read_jobs(&path).unwrap(), jobs);
    }

    #[test]
    fn test_records_carry_no_status() {
        let json = serde_json::to_value(vec![DownloadJob::new(["https://music.apple.com/us/album/a/1"])]).unwrap();
        let record = json[0].as_object().unwrap();
        let mut keys: Vec<_> = record.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["options".to_string(), "urls".to_string()]);
    }

    #[test]
    fn test_unknown_codec_is_user_error() {
        let raw = r#"[{"urls":["https://music.apple.com/us/album/a/1"],"options":{"song_codec":"flac"}}]"#;
        assert!(matches!(parse_jobs(raw), Err(AppError::UserInput(_))));
    }

    #[test]
    fn test_malformed_json_is_user_error() {
        assert!(matches!(parse_jobs("{"), Err(AppError::UserInput(_))));
        assert!(matches!(
            read_jobs(Path::new("/definitely/not/here.json")),
            Err(AppError::UserInput(_))
        ));
    }

    #[test]
    fn test_missing_options_field_accepted() {
        let jobs = parse_jobs(r#"[{"urls":["https://music.apple.com/us/album/a/1"]}]"#).unwrap();
        assert_eq!(jobs[0].options, None);
    }
}
