//! Stable file identifiers used as optimistic-concurrency tokens.
//!
//! A fingerprint is a deterministic function of `(path, content)`: two files
//! with the same path and identical content always share a fingerprint, and
//! any edit changes it. Tool calls present the fingerprint they were shown
//! (`fileId`) so the daemon can detect edits computed against a stale base.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha1::Digest;
use sha1::Sha1;

/// Digest `(path, content)` into a short opaque id. The NUL separator keeps
/// `("ab", "c")` and `("a", "bc")` distinct.
pub fn file_fingerprint(path: &str, content: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..12])
}
