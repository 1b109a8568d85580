/// A reusable byte workspace.
///
/// Wraps a `Vec<u8>` whose capacity survives `reset`, so the hot paths of the
/// writer and reader can stage frame data without reallocating per frame.
#[derive(Debug, Default)]
pub(crate) struct ScratchBuf {
    inner: Vec<u8>,
}

impl ScratchBuf {
    pub(crate) fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Ensures capacity for at least `n` bytes in total.
    ///
    /// Growth at least doubles the current capacity, so repeated small
    /// reservations stay amortized.
    pub(crate) fn reserve(&mut self, n: usize) {
        if n > self.inner.capacity() {
            let target = n.max(self.inner.capacity() * 2);
            self.inner.reserve(target - self.inner.len());
        }
    }

    /// Sets the logical size to `n`, growing the allocation as required.
    ///
    /// New bytes are zeroed; callers treat anything beyond what they wrote
    /// themselves as unspecified.
    pub(crate) fn resize(&mut self, n: usize) {
        self.reserve(n);
        self.inner.resize(n, 0);
    }

    pub(crate) fn extend_from_slice(&mut self, src: &[u8]) {
        self.reserve(self.inner.len() + src.len());
        self.inner.extend_from_slice(src);
    }

    /// Size back to zero, capacity retained.
    pub(crate) fn reset(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// The inner vector, for sinks that append through `std::io::Write`.
    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.inner
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Truncates to `n` bytes. No-op if the buffer is already shorter.
    pub(crate) fn truncate(&mut self, n: usize) {
        self.inner.truncate(n);
    }
}
