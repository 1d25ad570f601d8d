//! Integrity Validator
//!
//! Inspects one unit directory against its manifest. Inspection is blocking
//! filesystem and image work, so it runs on the blocking pool.

use super::{RecommendedAction, ValidationOptions, ValidationResult};
use crate::config::IntegrityConfig;
use crate::error::{Error, Result};
use crate::library::{ChapterLibrary, ChapterManifest, MANIFEST_FILE, PieceRecord};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scores downloaded units
#[derive(Clone, Debug)]
pub struct IntegrityValidator {
    library: ChapterLibrary,
    config: IntegrityConfig,
}

/// What inspecting a unit found, before scoring
#[derive(Debug, Default)]
struct Findings {
    missing: BTreeSet<u32>,
    corrupt: BTreeSet<u32>,
    warnings: Vec<String>,
    total_pieces: usize,
    /// Manifest absent, unreadable, empty or with inconsistent indices
    structural: bool,
    /// Something could not be inspected for reasons other than damage
    ambiguous: bool,
}

impl IntegrityValidator {
    /// Create a validator over a library
    pub fn new(library: ChapterLibrary, config: IntegrityConfig) -> Self {
        Self { library, config }
    }

    /// Validate one unit
    pub async fn validate_unit(
        &self,
        owner_id: &str,
        unit_key: &str,
        options: ValidationOptions,
    ) -> Result<ValidationResult> {
        let dir = self.library.unit_dir(owner_id, unit_key);
        let min_bytes = self.config.min_piece_bytes;

        let findings = tokio::task::spawn_blocking(move || inspect_unit(&dir, options, min_bytes))
            .await
            .map_err(|e| Error::Other(format!("validation task failed: {}", e)))?;

        let result = self.score(owner_id, unit_key, findings);
        debug!(
            owner_id,
            unit_key,
            score = result.integrity_score,
            action = ?result.recommended_action,
            missing = result.missing_pieces.len(),
            corrupt = result.corrupt_pieces.len(),
            "validated unit"
        );
        Ok(result)
    }

    fn score(&self, owner_id: &str, unit_key: &str, findings: Findings) -> ValidationResult {
        let penalty = findings.missing.len() as u64 * u64::from(self.config.missing_piece_penalty)
            + findings.corrupt.len() as u64 * u64::from(self.config.corrupt_piece_penalty)
            + findings.warnings.len() as u64 * u64::from(self.config.warning_penalty);
        let integrity_score = if findings.structural {
            0
        } else {
            100u64.saturating_sub(penalty) as u8
        };

        let damaged = !findings.missing.is_empty() || !findings.corrupt.is_empty();
        let passing = integrity_score >= self.config.repair_threshold;
        let is_valid = !findings.structural && !findings.ambiguous && !damaged && passing;

        let recommended_action = if findings.ambiguous {
            RecommendedAction::ManualCheck
        } else if findings.structural || integrity_score == 0 {
            RecommendedAction::RedownloadAll
        } else if damaged {
            RecommendedAction::RedownloadCorrupted
        } else if !passing {
            RecommendedAction::ManualCheck
        } else {
            RecommendedAction::None
        };

        ValidationResult {
            owner_id: owner_id.to_string(),
            unit_key: unit_key.to_string(),
            is_valid,
            integrity_score,
            missing_pieces: findings.missing,
            corrupt_pieces: findings.corrupt,
            recommended_action,
            warnings: findings.warnings,
            total_pieces: findings.total_pieces,
        }
    }
}

fn inspect_unit(dir: &Path, options: ValidationOptions, min_bytes: u64) -> Findings {
    let mut findings = Findings::default();

    let manifest = match std::fs::read(dir.join(MANIFEST_FILE)) {
        Ok(raw) => match serde_json::from_slice::<ChapterManifest>(&raw) {
            Ok(m) => m,
            Err(e) => {
                findings.structural = true;
                findings.warnings.push(format!("manifest is unreadable: {}", e));
                return findings;
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            findings.structural = true;
            findings.warnings.push("manifest is missing".to_string());
            return findings;
        }
        Err(e) => {
            findings.ambiguous = true;
            findings
                .warnings
                .push(format!("cannot read manifest: {}", e));
            return findings;
        }
    };

    if manifest.pieces.is_empty() {
        findings.structural = true;
        findings.warnings.push("manifest lists no pieces".to_string());
        return findings;
    }

    // A complete manifest holds each index in 0..len exactly once
    let count = manifest.pieces.len();
    let mut seen = vec![false; count];
    for piece in &manifest.pieces {
        match seen.get_mut(piece.index as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                findings.structural = true;
                findings.warnings.push(format!(
                    "manifest piece index {} is out of range or repeated ({} pieces)",
                    piece.index, count
                ));
                return findings;
            }
        }
    }
    findings.total_pieces = count;

    for piece in &manifest.pieces {
        inspect_piece(dir, piece, options, min_bytes, &mut findings);
    }

    if options.deep_scan {
        report_unlisted_files(dir, &manifest, &mut findings);
    }

    findings
}

fn inspect_piece(
    dir: &Path,
    piece: &PieceRecord,
    options: ValidationOptions,
    min_bytes: u64,
    findings: &mut Findings,
) {
    let path = dir.join(&piece.file_name);

    let metadata = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            findings.missing.insert(piece.index);
            return;
        }
        Err(e) => {
            findings.ambiguous = true;
            findings
                .warnings
                .push(format!("cannot stat {}: {}", piece.file_name, e));
            return;
        }
    };

    if !metadata.is_file() {
        findings.corrupt.insert(piece.index);
        return;
    }

    if options.validate_file_size && (metadata.len() < min_bytes || metadata.len() != piece.size) {
        findings.corrupt.insert(piece.index);
        return;
    }

    let needs_bytes = options.validate_content || options.deep_scan;
    let bytes = if needs_bytes {
        match std::fs::read(&path) {
            Ok(b) => Some(b),
            Err(e) => {
                record_read_error(piece, &e, findings);
                return;
            }
        }
    } else {
        None
    };

    if options.validate_format {
        let header = match &bytes {
            Some(b) => Ok(b[..b.len().min(64)].to_vec()),
            None => read_header(&path),
        };
        match header {
            Ok(header) => match image::guess_format(&header) {
                Ok(format) => {
                    let ext = Path::new(&piece.file_name)
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(str::to_ascii_lowercase);
                    let matches_ext = ext
                        .as_deref()
                        .is_some_and(|ext| format.extensions_str().iter().any(|known| *known == ext));
                    if !matches_ext {
                        findings.warnings.push(format!(
                            "{} holds {:?} data under a different extension",
                            piece.file_name, format
                        ));
                    }
                }
                Err(_) => {
                    findings.corrupt.insert(piece.index);
                    return;
                }
            },
            Err(e) => {
                record_read_error(piece, &e, findings);
                return;
            }
        }
    }

    if let Some(bytes) = &bytes {
        if options.validate_content && format!("{:x}", Sha256::digest(bytes)) != piece.sha256 {
            findings.corrupt.insert(piece.index);
            return;
        }
        if options.deep_scan && image::load_from_memory(bytes).is_err() {
            findings.corrupt.insert(piece.index);
            return;
        }
    }

    if options.check_dimensions {
        let dims = image::ImageReader::open(&path)
            .and_then(|r| r.with_guessed_format())
            .map_err(image::ImageError::IoError)
            .and_then(|r| r.into_dimensions());
        match dims {
            Ok((w, h)) if piece.width == 0 && piece.height == 0 => {
                debug!(file = %piece.file_name, w, h, "no recorded dimensions to compare");
            }
            Ok((w, h)) if (w, h) == (piece.width, piece.height) => {}
            _ => {
                findings.corrupt.insert(piece.index);
            }
        }
    }
}

fn record_read_error(piece: &PieceRecord, e: &std::io::Error, findings: &mut Findings) {
    if e.kind() == ErrorKind::NotFound {
        findings.missing.insert(piece.index);
    } else {
        findings.ambiguous = true;
        findings
            .warnings
            .push(format!("cannot read {}: {}", piece.file_name, e));
    }
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(64);
    std::fs::File::open(path)?
        .take(64)
        .read_to_end(&mut header)?;
    Ok(header)
}

fn report_unlisted_files(dir: &Path, manifest: &ChapterManifest, findings: &mut Findings) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == MANIFEST_FILE || name.starts_with('.') {
            continue;
        }
        if !manifest.pieces.iter().any(|p| p.file_name == name) {
            findings
                .warnings
                .push(format!("{} is not listed in the manifest", name));
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::piece_file_name;
    use crate::test_helpers::write_unit;

    async fn healthy_unit(root: &Path, pieces: u32) -> ChapterLibrary {
        let library = ChapterLibrary::new(root);
        write_unit(&library, "m", "1", pieces).await;
        library
    }

    fn validator(library: ChapterLibrary) -> IntegrityValidator {
        IntegrityValidator::new(library, IntegrityConfig::default())
    }

    fn piece_path(library: &ChapterLibrary, index: u32) -> PathBuf {
        library
            .unit_dir("m", "1")
            .join(piece_file_name(index, "png"))
    }

    #[tokio::test]
    async fn healthy_unit_scores_full_marks() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 4).await;

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::full())
            .await
            .unwrap();
        assert!(result.is_valid);
        assert_eq!(result.integrity_score, 100);
        assert_eq!(result.recommended_action, RecommendedAction::None);
        assert_eq!(result.total_pieces, 4);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[tokio::test]
    async fn two_missing_pieces_recommend_partial_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 10).await;
        std::fs::remove_file(piece_path(&library, 2)).unwrap();
        std::fs::remove_file(piece_path(&library, 5)).unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.missing_pieces, BTreeSet::from([2, 5]));
        assert!(result.corrupt_pieces.is_empty());
        assert_eq!(result.integrity_score, 100 - 2 * 20);
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadCorrupted);
    }

    #[tokio::test]
    async fn truncated_piece_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 3).await;
        std::fs::write(piece_path(&library, 1), b"\x89PNG").unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.corrupt_pieces, BTreeSet::from([1]));
        assert_eq!(result.integrity_score, 90);
        assert!(!result.is_valid);
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadCorrupted);
    }

    #[tokio::test]
    async fn checksum_mismatch_needs_content_stage() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;

        // same size, same header, different bytes
        let path = piece_path(&library, 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 20;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let v = validator(library);
        let quick = v
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert!(quick.is_valid);

        let opts = ValidationOptions {
            validate_content: true,
            ..ValidationOptions::quick()
        };
        let thorough = v.validate_unit("m", "1", opts).await.unwrap();
        assert_eq!(thorough.corrupt_pieces, BTreeSet::from([0]));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;
        let mut manifest = library.read_manifest("m", "1").await.unwrap();
        manifest.pieces[1].width = 999;
        library.write_manifest(&manifest).await.unwrap();

        let opts = ValidationOptions {
            check_dimensions: true,
            ..ValidationOptions::quick()
        };
        let result = validator(library).validate_unit("m", "1", opts).await.unwrap();
        assert_eq!(result.corrupt_pieces, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn missing_manifest_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;
        std::fs::remove_file(library.manifest_path("m", "1")).unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.integrity_score, 0);
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn absent_unit_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let result = validator(ChapterLibrary::new(dir.path()))
            .validate_unit("nobody", "0", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
    }

    #[tokio::test]
    async fn everything_missing_floors_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 6).await;
        for index in 0..6 {
            std::fs::remove_file(piece_path(&library, index)).unwrap();
        }

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.integrity_score, 0);
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
    }

    #[tokio::test]
    async fn manifest_gap_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 3).await;
        let mut manifest = library.read_manifest("m", "1").await.unwrap();
        manifest.pieces.remove(1);
        library.write_manifest(&manifest).await.unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.integrity_score, 0);
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
        assert!(result.missing_pieces.is_empty());
    }

    #[tokio::test]
    async fn huge_piece_index_is_rejected_without_scanning_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;
        let mut manifest = library.read_manifest("m", "1").await.unwrap();
        manifest.pieces[1].index = 20_000_000;
        library.write_manifest(&manifest).await.unwrap();

        let started = std::time::Instant::now();
        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
        assert_eq!(result.integrity_score, 0);
        assert!(result.missing_pieces.is_empty());
        assert_eq!(result.total_pieces, 0);
    }

    #[tokio::test]
    async fn repeated_piece_index_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 3).await;
        let mut manifest = library.read_manifest("m", "1").await.unwrap();
        manifest.pieces[2].index = 0;
        library.write_manifest(&manifest).await.unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::RedownloadAll);
    }

    #[tokio::test]
    async fn deep_scan_warns_about_unlisted_files() {
        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;
        std::fs::write(library.unit_dir("m", "1").join("stray.txt"), b"x").unwrap();

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::full())
            .await
            .unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.integrity_score, 98);
        assert!(result.is_valid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_manifest_needs_manual_check() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let library = healthy_unit(dir.path(), 2).await;
        let manifest = library.manifest_path("m", "1");
        std::fs::set_permissions(&manifest, std::fs::Permissions::from_mode(0o000)).unwrap();

        // root ignores permission bits
        if std::fs::read(&manifest).is_ok() {
            return;
        }

        let result = validator(library)
            .validate_unit("m", "1", ValidationOptions::quick())
            .await
            .unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::ManualCheck);
        assert!(!result.is_valid);
    }
}
