//! Archive of winning probe frames, referenced from attendance records.

use chrono::Utc;
use rollcall_core::{FrameArchive, SessionId};
use std::path::PathBuf;

pub struct ProbeArchive {
    dir: PathBuf,
}

impl ProbeArchive {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Write `frame` as `{session}_{timestamp}.{ext}` and return its path.
    /// Failures are logged; the record is then written without a path.
    pub fn save(&self, session: SessionId, frame: &[u8]) -> Option<String> {
        let name = format!(
            "{session}_{}.{}",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            extension(frame)
        );
        let path = self.dir.join(name);
        let written = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, frame));
        match written {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "probe archive failed");
                None
            }
        }
    }

    /// Remove a frame saved for a record that was never written.
    pub fn discard(&self, path: &str) {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path, "unreferenced probe frame removed"),
            Err(e) => tracing::warn!(path, error = %e, "failed to remove probe frame"),
        }
    }
}

/// The frames of one attendance request, archived under its session.
pub struct SessionFrames<'a> {
    pub archive: &'a ProbeArchive,
    pub session: SessionId,
    pub frames: &'a [Vec<u8>],
}

impl FrameArchive for SessionFrames<'_> {
    fn save(&self, index: usize) -> Option<String> {
        let frame = self.frames.get(index)?;
        self.archive.save(self.session, frame)
    }

    fn discard(&self, path: &str) {
        self.archive.discard(path)
    }
}

fn extension(frame: &[u8]) -> &'static str {
    image::guess_format(frame)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin")
}
