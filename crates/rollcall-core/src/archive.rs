//! Provenance storage for the frame that produced a match.

/// Keeps a copy of a winning frame and hands back a path to store on the
/// record. `discard` undoes a `save` whose record was never written.
pub trait FrameArchive {
    /// Persist the frame at `index`; `None` if nothing was kept.
    fn save(&self, index: usize) -> Option<String>;

    fn discard(&self, _path: &str) {}
}

/// Archive that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArchive;

impl FrameArchive for NoArchive {
    fn save(&self, _index: usize) -> Option<String> {
        None
    }
}

/// Closures act as save-only archives.
impl<F> FrameArchive for F
where
    F: Fn(usize) -> Option<String>,
{
    fn save(&self, index: usize) -> Option<String> {
        self(index)
    }
}

/// Re-indexes an archive so probe positions map back to frame positions.
pub(crate) struct Remapped<'a, A: ?Sized> {
    pub inner: &'a A,
    pub origin: &'a [usize],
}

impl<A: FrameArchive + ?Sized> FrameArchive for Remapped<'_, A> {
    fn save(&self, index: usize) -> Option<String> {
        self.origin.get(index).and_then(|&i| self.inner.save(i))
    }

    fn discard(&self, path: &str) {
        self.inner.discard(path)
    }
}
