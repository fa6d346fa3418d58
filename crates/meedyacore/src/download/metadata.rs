//! Codec identification tags for finished downloads.
//!
//! The downloader does not record which codec a file was fetched in. After a
//! song completes, every `.m4a` under its output path gets freeform atoms that
//! media players and library tools can pick up:
//!
//! - ALAC: `----:com.apple.iTunes:isLossless = Y`
//! - Dolby Atmos / Dolby Digital: `SpatialType` under both the iTunes and the
//!   `MeedyaMeta` namespaces
//!
//! Only the metadata atoms are rewritten; audio data is left untouched.

use mp4ameta::{Data, FreeformIdent, Tag};
use std::path::{Path, PathBuf};

use crate::core::error::{AppError, AppResult};
use crate::download::codec::{CodecClass, SongCodec};

const ITUNES_NAMESPACE: &str = "com.apple.iTunes";
const MEEDYA_NAMESPACE: &str = "MeedyaMeta";

/// One freeform atom to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeformTag {
    pub namespace: &'static str,
    pub name: &'static str,
    pub value: &'static str,
}

/// Atoms to write for a codec. Empty for lossy codecs.
pub fn tags_for(codec: SongCodec) -> Vec<FreeformTag> {
    match codec.class() {
        CodecClass::Lossless => vec![FreeformTag {
            namespace: ITUNES_NAMESPACE,
            name: "isLossless",
            value: "Y",
        }],
        CodecClass::Spatial => match codec.spatial_label() {
            Some(label) => vec![
                FreeformTag {
                    namespace: ITUNES_NAMESPACE,
                    name: "SpatialType",
                    value: label,
                },
                FreeformTag {
                    namespace: MEEDYA_NAMESPACE,
                    name: "SpatialType",
                    value: label,
                },
            ],
            None => Vec::new(),
        },
        CodecClass::Lossy => Vec::new(),
    }
}

/// Tag every `.m4a` at or below `output_path`. Returns how many files were tagged.
///
/// Blocking; run it on the blocking pool. Files that fail to read or write are
/// logged and skipped.
pub fn tag_output(output_path: &Path, codec: SongCodec) -> AppResult<usize> {
    let tags = tags_for(codec);
    if tags.is_empty() {
        log::debug!("No codec tags for {}, skipping {}", codec, output_path.display());
        return Ok(0);
    }

    let count = if output_path.is_file() {
        usize::from(is_m4a(output_path) && tag_file_logged(output_path, &tags))
    } else if output_path.is_dir() {
        tag_directory(output_path, &tags)
    } else {
        return Err(AppError::PostProcessing(format!(
            "output path does not exist: {}",
            output_path.display()
        )));
    };

    log::info!("Tagged {} file(s) as {} under {}", count, codec.display_name(), output_path.display());
    Ok(count)
}

/// Tag every path of a finished download, e.g. each saved track of an album.
///
/// Paths that fail are logged and skipped. Returns the total number of files tagged.
pub fn tag_outputs(paths: &[PathBuf], codec: SongCodec) -> usize {
    paths
        .iter()
        .map(|path| match tag_output(path, codec) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Codec tagging skipped {}: {}", path.display(), e);
                0
            }
        })
        .sum()
}

fn tag_directory(dir: &Path, tags: &[FreeformTag]) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot read directory {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // disc subfolders
            count += tag_directory(&path, tags);
        } else if is_m4a(&path) && tag_file_logged(&path, tags) {
            count += 1;
        }
    }
    count
}

fn tag_file_logged(path: &Path, tags: &[FreeformTag]) -> bool {
    match tag_file(path, tags) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Skipping {}: {}", path.display(), e);
            false
        }
    }
}

fn tag_file(path: &Path, tags: &[FreeformTag]) -> AppResult<()> {
    let mut tag = Tag::read_from_path(path)
        .map_err(|e| AppError::PostProcessing(format!("cannot read MP4 metadata: {}", e)))?;

    for t in tags {
        tag.set_data(FreeformIdent::new_static(t.namespace, t.name), Data::Utf8(t.value.to_owned()));
    }

    tag.write_to_path(path)
        .map_err(|e| AppError::PostProcessing(format!("cannot write MP4 metadata: {}", e)))?;
    log::debug!("Tagged {}", path.display());
    Ok(())
}

fn is_m4a(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("m4a"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lossless_tags() {
        assert_eq!(
            tags_for(SongCodec::Alac),
            vec![FreeformTag {
                namespace: "com.apple.iTunes",
                name: "isLossless",
                value: "Y",
            }]
        );
    }

    #[test]
    fn test_spatial_tags_use_both_namespaces() {
        let atmos = tags_for(SongCodec::Atmos);
        assert_eq!(atmos.len(), 2);
        assert!(atmos.iter().all(|t| t.name == "SpatialType" && t.value == "Dolby Atmos"));
        assert_eq!(atmos[1].namespace, "MeedyaMeta");

        let ac3 = tags_for(SongCodec::Ac3);
        assert!(ac3.iter().all(|t| t.value == "Dolby Digital"));
    }

    #[test]
    fn test_lossy_codecs_get_nothing() {
        assert!(tags_for(SongCodec::Aac).is_empty());
        assert!(tags_for(SongCodec::AacLegacy).is_empty());
    }

    #[test]
    fn test_missing_output_path_is_error() {
        let err = tag_output(Path::new("/no/such/dir/song.m4a"), SongCodec::Alac).unwrap_err();
        assert!(matches!(err, AppError::PostProcessing(_)));
    }

    #[test]
    fn test_lossy_codec_skips_without_touching_disk() {
        assert_eq!(tag_output(Path::new("/no/such/dir"), SongCodec::Aac).unwrap(), 0);
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let disc = dir.path().join("Disc 1");
        std::fs::create_dir(&disc).unwrap();
        std::fs::write(disc.join("01 Song.m4a"), b"not an mp4").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"jpeg").unwrap();

        assert_eq!(tag_output(dir.path(), SongCodec::Alac).unwrap(), 0);
    }

    #[test]
    fn test_tag_outputs_visits_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("01 A.m4a");
        let second = dir.path().join("02 C.m4a");
        std::fs::write(&first, b"not an mp4").unwrap();
        std::fs::write(&second, b"not an mp4").unwrap();
        let missing = dir.path().join("03 gone.m4a");

        // Unreadable and missing files are skipped without stopping the rest.
        assert_eq!(tag_outputs(&[first, missing, second], SongCodec::Atmos), 0);
    }

    #[test]
    fn test_is_m4a() {
        assert!(is_m4a(Path::new("a/b/Song.M4A")));
        assert!(!is_m4a(Path::new("a/b/song.mp4")));
        assert!(!is_m4a(Path::new("a/b/m4a")));
    }
}
