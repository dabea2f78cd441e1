//! Choosing the playable file of a torrent.

use super::layout;
use crate::swarm::SwarmFile;

/// Container extensions a browser player can be pointed at, lowercase.
pub const VIDEO_EXTENSIONS: [&str; 19] = [
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "mpg", "mpeg", "m4v", "3gp", "3g2", "ts",
    "vob", "ogv", "rm", "rmvb", "asf", "f4v",
];

/// True if `path` ends with an allow-listed extension (case-insensitive).
pub fn is_video_file(path: &str) -> bool {
    let Some((stem, extension)) = path.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty()
        && VIDEO_EXTENSIONS
            .iter()
            .any(|known| extension.eq_ignore_ascii_case(known))
}

/// Index of the first non-empty video file, in engine order.
///
/// Files whose path cannot be mapped safely below a session directory are
/// skipped. The result only depends on the file list, so it is stable
/// across runs.
pub fn select_playable_file(files: &[SwarmFile]) -> Option<usize> {
    files.iter().position(|file| {
        file.size > 0 && is_video_file(&file.path) && layout::relative_media_path(&file.path).is_some()
    })
}
