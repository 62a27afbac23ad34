//! Streaming SHA-256 utilities shared by the tar writer, cache, and registry
//! client.

use sha2::{Digest as _, Sha256};
use std::io::{self, Write};

use crate::oci::Digest;

/// A `Write` sink that hashes every byte passed through it while forwarding
/// to an inner sink. Used to compute a layer's diff_id and compressed digest
/// in the same streaming pass the layer is written in (§5: "hashed twice in
/// a single streaming pipeline").
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    size: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consume the writer, returning the inner sink and the digest of
    /// everything written.
    pub fn finish(self) -> (W, Digest) {
        let hex = hex::encode(self.hasher.finalize());
        (self.inner, Digest::new(hex))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compute the digest of an in-memory byte slice.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::new(hex::encode(hasher.finalize()))
}

/// Verify that `data` hashes to `expected`; returns the computed digest either way.
pub fn verify(data: &[u8], expected: &Digest) -> Result<(), crate::error::BuildError> {
    let actual = digest_bytes(data);
    if &actual != expected {
        return Err(crate::error::BuildError::DigestMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_string() {
        let d = digest_bytes(b"hello world");
        assert_eq!(
            d.hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hashing_writer_matches_direct_hash() {
        let mut out = Vec::new();
        let (inner, digest) = {
            let mut w = HashingWriter::new(&mut out);
            w.write_all(b"abc123").unwrap();
            w.finish()
        };
        assert_eq!(inner, &b"abc123"[..]);
        assert_eq!(digest, digest_bytes(b"abc123"));
    }

    #[test]
    fn verify_rejects_mismatch() {
        let expected = digest_bytes(b"right");
        assert!(verify(b"right", &expected).is_ok());
        assert!(verify(b"wrong", &expected).is_err());
    }
}
