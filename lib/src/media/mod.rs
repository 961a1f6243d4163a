//! Media files on disk and the structures that browse them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, warn};

pub mod cache;
pub mod decode;
pub mod video;

pub use cache::{CachedMedia, PredictiveMediaCache, SlotPosition, SlotState};
pub use decode::{CacheLoadError, ImageDecoder, MediaDecoder};

const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "bmp", "tiff", "webp", "gif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classifies a path by its extension.
    pub fn from_path(path: &Path) -> Option<MediaKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub modified: SystemTime,
}

impl MediaEntry {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Media entries ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaList {
    entries: Vec<MediaEntry>,
}

impl MediaList {
    pub fn from_entries(mut entries: Vec<MediaEntry>) -> Self {
        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Self { entries }
    }

    /// Lists supported media in `dir`. Images whose header isn't a known
    /// format are skipped; videos are only listed when `include_video` is set.
    pub async fn scan(dir: &Path, include_video: bool) -> std::io::Result<Self> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&dir, include_video))
            .await
            .map_err(std::io::Error::other)?
    }

    fn scan_blocking(dir: &Path, include_video: bool) -> std::io::Result<Self> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let Some(kind) = MediaKind::from_path(&path) else {
                continue;
            };
            if kind == MediaKind::Video && !include_video {
                continue;
            }
            let metadata = match dirent.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("failed to stat {}: {e}", path.display());
                    continue;
                }
            };
            if kind == MediaKind::Image && !has_image_header(&path) {
                debug!("skipping {}: not a recognised image", path.display());
                continue;
            }
            entries.push(MediaEntry {
                path,
                kind,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[MediaEntry] {
        &self.entries
    }

    /// Removes one entry. Order of the rest is unchanged.
    pub fn remove(&mut self, index: usize) -> Option<MediaEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    /// A shared copy for the cache's background loads.
    pub fn snapshot(&self) -> Arc<[MediaEntry]> {
        self.entries.as_slice().into()
    }
}

fn has_image_header(path: &Path) -> bool {
    use std::io::Read;
    let mut header = [0u8; 32];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(n) = file.read(&mut header) else {
        return false;
    };
    image::guess_format(&header[..n]).is_ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub fn entry(name: &str, age_secs: u64) -> MediaEntry {
        MediaEntry {
            path: PathBuf::from(name),
            kind: MediaKind::from_path(Path::new(name)).unwrap_or(MediaKind::Image),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    fn write_png(path: &Path) {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        image.save(path).unwrap();
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("a.mkv")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("a.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_sorted_newest_first() {
        let list = MediaList::from_entries(vec![entry("old.png", 30), entry("new.png", 1), entry("mid.png", 10)]);
        let names: Vec<String> = list.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["new.png", "mid.png", "old.png"]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut list = MediaList::from_entries(vec![entry("a.png", 1), entry("b.png", 2), entry("c.png", 3)]);
        assert_eq!(list.remove(1).map(|e| e.name()), Some("b.png".to_string()));
        let names: Vec<String> = list.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["a.png", "c.png"]);
        assert!(list.remove(5).is_none());
    }

    #[tokio::test]
    async fn test_scan_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("shot.png"));
        std::fs::write(dir.path().join("fake.jpg"), b"definitely not a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"\0\0\0\x18ftypmp42").unwrap();

        let stills = MediaList::scan(dir.path(), false).await.unwrap();
        let names: Vec<String> = stills.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["shot.png"]);

        let all = MediaList::scan(dir.path(), true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.entries().iter().any(|e| e.kind == MediaKind::Video));
    }

    #[tokio::test]
    async fn test_scan_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MediaList::scan(&dir.path().join("gone"), true).await.is_err());
    }
}
