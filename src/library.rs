//! On-disk chapter layout
//!
//! Each unit lives in `{download_dir}/{owner}/{unit}/` next to a
//! `manifest.json` describing its pieces. Directory names are the
//! percent-encoded ids; the manifest keeps the ids verbatim.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the per-unit manifest
pub const MANIFEST_FILE: &str = "manifest.json";

/// One downloaded piece as recorded at download time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceRecord {
    /// Position within the unit, starting at 0
    pub index: u32,
    /// File name inside the unit directory
    pub file_name: String,
    /// Where the piece was fetched from
    pub source_url: String,
    /// Size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents
    pub sha256: String,
    /// Pixel width
    #[serde(default)]
    pub width: u32,
    /// Pixel height
    #[serde(default)]
    pub height: u32,
}

/// Expected structure of a downloaded unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterManifest {
    /// Owner (title) id
    pub owner_id: String,
    /// Unit (chapter) key
    pub unit_key: String,
    /// Source reference the unit was resolved from
    pub source_url: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// Pieces in index order
    pub pieces: Vec<PieceRecord>,
    /// Completion time in epoch milliseconds
    #[serde(default)]
    pub completed_at: i64,
}

impl ChapterManifest {
    /// Look up a piece by index
    pub fn piece(&self, index: u32) -> Option<&PieceRecord> {
        self.pieces.iter().find(|p| p.index == index)
    }

    /// Insert or replace the record for `piece.index`, keeping index order
    pub fn upsert_piece(&mut self, piece: PieceRecord) {
        match self.pieces.binary_search_by_key(&piece.index, |p| p.index) {
            Ok(pos) => self.pieces[pos] = piece,
            Err(pos) => self.pieces.insert(pos, piece),
        }
    }
}

/// A unit found on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUnit {
    /// Owner (title) id
    pub owner_id: String,
    /// Unit (chapter) key
    pub unit_key: String,
    /// Unit directory
    pub path: PathBuf,
}

/// Encode an id as a single path component
///
/// Everything except ASCII alphanumerics and `-_.~` is percent-encoded, so
/// distinct ids never share a directory and [`restore_component`] gives the
/// id back. The empty id and all-dot ids get reserved spellings.
pub fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    if raw.chars().all(|c| c == '.') {
        return "%2E".repeat(raw.len());
    }
    urlencoding::encode(raw).into_owned()
}

/// The id a directory name was encoded from
///
/// Names that are not valid encodings (created by hand) are returned as-is.
pub fn restore_component(name: &str) -> String {
    if name == "%" {
        return String::new();
    }
    match urlencoding::decode(name) {
        Ok(id) => id.into_owned(),
        Err(_) => name.to_string(),
    }
}

/// File name for a piece: zero-padded index plus extension
pub fn piece_file_name(index: u32, extension: &str) -> String {
    format!("{:03}.{}", index, extension)
}

/// Root of the downloaded chapters
#[derive(Clone, Debug)]
pub struct ChapterLibrary {
    root: PathBuf,
}

impl ChapterLibrary {
    /// Create a library rooted at `root`; nothing is created on disk yet
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The library root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a unit
    pub fn unit_dir(&self, owner_id: &str, unit_key: &str) -> PathBuf {
        self.root
            .join(encode_component(owner_id))
            .join(encode_component(unit_key))
    }

    /// Path of a unit's manifest
    pub fn manifest_path(&self, owner_id: &str, unit_key: &str) -> PathBuf {
        self.unit_dir(owner_id, unit_key).join(MANIFEST_FILE)
    }

    /// Read a unit's manifest
    ///
    /// I/O errors are returned as-is so callers can tell a missing manifest
    /// from an unreadable one.
    pub async fn read_manifest(&self, owner_id: &str, unit_key: &str) -> Result<ChapterManifest> {
        let raw = tokio::fs::read(self.manifest_path(owner_id, unit_key)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write a unit's manifest atomically
    pub async fn write_manifest(&self, manifest: &ChapterManifest) -> Result<()> {
        let dir = self.unit_dir(&manifest.owner_id, &manifest.unit_key);
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&dir, MANIFEST_FILE, &json).await
    }

    /// Write a piece file atomically
    pub async fn write_piece(
        &self,
        owner_id: &str,
        unit_key: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.unit_dir(owner_id, unit_key);
        write_atomic(&dir, &encode_component(file_name), bytes).await?;
        Ok(dir.join(encode_component(file_name)))
    }

    /// Delete a unit directory and everything in it
    ///
    /// Returns `false` if the unit was not on disk.
    pub async fn remove_unit(&self, owner_id: &str, unit_key: &str) -> Result<bool> {
        let dir = self.unit_dir(owner_id, unit_key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(path = %dir.display(), "Removed unit directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every unit directory in the library
    ///
    /// Ids come from the manifest when it is readable and from the directory
    /// names otherwise, so broken units are still listed.
    pub async fn list_units(&self) -> Result<Vec<StoredUnit>> {
        let mut units = Vec::new();

        let mut owners = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(units),
            Err(e) => return Err(e.into()),
        };

        while let Some(owner_entry) = owners.next_entry().await? {
            if !owner_entry.file_type().await?.is_dir() {
                continue;
            }
            let owner_name = owner_entry.file_name().to_string_lossy().into_owned();

            let mut chapters = tokio::fs::read_dir(owner_entry.path()).await?;
            while let Some(unit_entry) = chapters.next_entry().await? {
                if !unit_entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = unit_entry.path();
                let unit_name = unit_entry.file_name().to_string_lossy().into_owned();

                let (owner_id, unit_key) = match tokio::fs::read(path.join(MANIFEST_FILE)).await {
                    Ok(raw) => match serde_json::from_slice::<ChapterManifest>(&raw) {
                        Ok(m) => (m.owner_id, m.unit_key),
                        Err(_) => (restore_component(&owner_name), restore_component(&unit_name)),
                    },
                    Err(_) => (restore_component(&owner_name), restore_component(&unit_name)),
                };
                units.push(StoredUnit {
                    owner_id,
                    unit_key,
                    path,
                });
            }
        }

        units.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(units)
    }
}

/// Write `bytes` to `dir/name` via a temporary file and rename
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{}.part", name));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, dir.join(name)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
