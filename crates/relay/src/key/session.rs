//! [`SessionKey`]: the externally supplied symmetric key for one run.

/// Raw key bytes held for the lifetime of a run.
///
/// Never persisted and never logged. When dropped, the memory is overwritten
/// with zeroes to shorten the window during which key material lives in RAM.
/// Length is not checked here; [`Cipher::new`](crate::crypto::Cipher::new)
/// rejects keys of the wrong size.
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Wrap key bytes obtained from the key provider.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the key bytes.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Number of key bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no key bytes are held.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("SessionKey([REDACTED])")
    }
}
