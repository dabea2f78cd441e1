//! On-disk layout: `<data_dir>/<title_id>/<quality>/`.
//!
//! Each session directory holds the media file at its torrent-relative path
//! and the `session.json` record.

use std::path::{Component, Path, PathBuf};

use super::SessionId;

/// File name of the per-session record.
pub const RECORD_FILE: &str = "session.json";

/// Directory owned by session `id`.
pub fn session_dir(data_dir: &Path, id: &SessionId) -> PathBuf {
    data_dir.join(id.title_id()).join(id.quality().to_string())
}

/// Path of the record inside a session directory.
pub fn record_path(session_dir: &Path) -> PathBuf {
    session_dir.join(RECORD_FILE)
}

/// Converts a torrent-relative path into a relative filesystem path.
///
/// Returns `None` for paths that are empty, absolute or climb with `..`,
/// and for paths that would collide with the record file.
pub fn relative_media_path(torrent_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for part in torrent_path.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if !part.contains(':') => relative.push(part),
            _ => return None,
        }
    }

    if relative.as_os_str().is_empty() || relative == Path::new(RECORD_FILE) {
        return None;
    }
    if torrent_path.starts_with(['/', '\\']) {
        return None;
    }
    Some(relative)
}

/// Absolute location of the media file inside a session directory.
pub fn media_path(session_dir: &Path, torrent_path: &str) -> Option<PathBuf> {
    relative_media_path(torrent_path).map(|relative| session_dir.join(relative))
}
