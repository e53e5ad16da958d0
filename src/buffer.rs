//! C1 — growable append-only byte buffer.
//!
//! Mirrors `original_source/pstring.c`'s contract: append, replace,
//! substring-from-offset (drop an already-sent prefix), and finalize
//! (guarantee a reachable trailing NUL without changing the logical
//! length). Rust's `Vec<u8>` already gives us most of this for free; the
//! point of keeping the type is the `substring`/`finalize` operations,
//! which spec.md §8 pins down as testable properties in their own right.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Append bytes to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Discard the previous contents and store `bytes` instead.
    pub fn replace(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Keep only the suffix starting at `begin`, discarding the consumed
    /// prefix. Used after a partial `send()` to retain the unsent tail.
    pub fn substring_from(&mut self, begin: usize) {
        if begin == 0 {
            return;
        }
        if begin >= self.data.len() {
            self.data.clear();
            return;
        }
        self.data.drain(0..begin);
    }

    /// Ensure a trailing NUL is reachable one byte past the logical length,
    /// without changing that length. A historical quirk of the original
    /// C-string-oriented buffer, kept for structural fidelity — nothing in
    /// this crate reads past `len()`, but the reservation is real.
    pub fn finalize(&mut self) {
        if self.data.capacity() == self.data.len() {
            self.data.reserve(1);
        }
        // SAFETY: capacity is guaranteed to be at least len()+1 above, and
        // writing one byte past `len` without touching `len` itself does
        // not expose uninitialized memory through any safe API, since
        // `as_slice`/`len` both stay bounded by the original length.
        unsafe {
            let ptr = self.data.as_mut_ptr().add(self.data.len());
            ptr.write(0);
        }
    }

    /// Release storage and reset to empty.
    pub fn free(&mut self) {
        self.data = Vec::new();
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Take the current contents, leaving an empty buffer behind.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_extract_roundtrip() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn substring_keeps_suffix() {
        let mut buf = ByteBuffer::new();
        buf.append(b"0123456789");
        buf.substring_from(4);
        assert_eq!(buf.as_slice(), b"456789");
    }

    #[test]
    fn substring_from_zero_is_noop() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc");
        buf.substring_from(0);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn substring_past_end_empties_buffer() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc");
        buf.substring_from(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn replace_discards_prior_contents() {
        let mut buf = ByteBuffer::new();
        buf.append(b"old");
        buf.replace(b"new");
        assert_eq!(buf.as_slice(), b"new");
    }

    #[test]
    fn finalize_does_not_change_length() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc");
        let len_before = buf.len();
        buf.finalize();
        assert_eq!(buf.len(), len_before);
    }

    #[test]
    fn finalize_on_empty_buffer_is_safe() {
        let mut buf = ByteBuffer::new();
        buf.finalize();
        assert_eq!(buf.len(), 0);
    }
}
