//! Enrolled embeddings persisted as JSON.
//!
//! The file holds the entries and the next id to hand out. A bare array of
//! [`GalleryEntry`] is still accepted on load.

use facecheck_core::{Embedding, GalleryEntry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("gallery format: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct GalleryFile<'a> {
    next_id: u32,
    entries: &'a [GalleryEntry],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredGallery {
    Counted {
        next_id: u32,
        entries: Vec<GalleryEntry>,
    },
    Bare(Vec<GalleryEntry>),
}

pub struct Gallery {
    path: PathBuf,
    entries: Vec<GalleryEntry>,
    /// Never lowered, so removed ids are not handed out again.
    next_id: u32,
}

impl Gallery {
    /// Open the gallery at `path`; a missing file is an empty gallery.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let stored = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredGallery::Bare(Vec::new()),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let (entries, stored_next) = match stored {
            StoredGallery::Counted { next_id, entries } => (entries, next_id),
            StoredGallery::Bare(entries) => (entries, 1),
        };
        let next_id = stored_next.max(highest_id(&entries).saturating_add(1));
        tracing::debug!(path = %path.display(), count = entries.len(), next_id, "gallery loaded");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            next_id,
        })
    }

    pub fn save(&self) -> Result<(), GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&GalleryFile {
            next_id: self.next_id,
            entries: &self.entries,
        })?;
        std::fs::write(&self.path, json).map_err(io_err)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Append an entry and return its id.
    pub fn add(&mut self, label: &str, embedding: Embedding) -> String {
        let id = format!("face-{:04}", self.next_id);
        self.next_id += 1;
        self.entries.push(GalleryEntry {
            id: id.clone(),
            label: label.to_string(),
            embedding,
        });
        id
    }

    /// Remove the entry with `id`; false if there was none.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }
}

/// Largest numeric suffix among `face-NNNN` ids, 0 if none.
fn highest_id(entries: &[GalleryEntry]) -> u32 {
    entries
        .iter()
        .filter_map(|e| e.id.strip_prefix("face-")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("facecheck-gallery-{}", std::process::id()))
            .join(name)
    }

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::from_raw(values, Some("w600k_r50".into())).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let gallery = Gallery::load(&temp_path("absent.json")).unwrap();
        assert!(gallery.entries().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("roundtrip.json");
        let mut gallery = Gallery::load(&path).unwrap();
        let a = gallery.add("normal", embedding(&[3.0, 4.0]));
        let b = gallery.add("glasses", embedding(&[1.0, 0.0]));
        assert_eq!(a, "face-0001");
        assert_eq!(b, "face-0002");
        gallery.save().unwrap();

        let reloaded = Gallery::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(reloaded.entries().len(), 2);
        assert_eq!(reloaded.entries()[1].label, "glasses");
        assert!((reloaded.entries()[0].embedding.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_remove_does_not_reuse_ids() {
        let mut gallery = Gallery::load(&temp_path("ids.json")).unwrap();
        gallery.add("a", embedding(&[1.0]));
        let b = gallery.add("b", embedding(&[1.0]));
        assert!(gallery.remove("face-0001"));
        assert!(!gallery.remove("face-0001"));
        assert_eq!(gallery.add("c", embedding(&[1.0])), "face-0003");
        assert_eq!(gallery.entries()[0].id, b);
    }

    #[test]
    fn test_corrupt_file() {
        let path = temp_path("corrupt.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        let result = Gallery::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(GalleryError::Format(_))));
    }

    #[test]
    fn test_removing_newest_id_does_not_reissue_it() {
        let path = temp_path("newest.json");
        let mut gallery = Gallery::load(&path).unwrap();
        gallery.add("a", embedding(&[1.0]));
        let newest = gallery.add("b", embedding(&[1.0]));
        assert!(gallery.remove(&newest));
        assert_eq!(gallery.add("c", embedding(&[1.0])), "face-0003");

        // The counter survives a save/load cycle after another removal.
        assert!(gallery.remove("face-0003"));
        gallery.save().unwrap();
        let mut reloaded = Gallery::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(reloaded.add("d", embedding(&[1.0])), "face-0004");
    }

    #[test]
    fn test_bare_array_file_still_loads() {
        let path = temp_path("bare.json");
        let entries = vec![GalleryEntry {
            id: "face-0007".into(),
            label: "old".into(),
            embedding: embedding(&[1.0, 0.0]),
        }];
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let mut gallery = Gallery::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(gallery.entries().len(), 1);
        assert_eq!(gallery.add("new", embedding(&[0.0, 1.0])), "face-0008");
    }
}
