pub mod error;
pub mod format;
pub mod fsutils;
pub mod lock;
pub mod setup;

use sha2::{Digest, Sha256};

/// 64-bit content address derived from a Sha256 digest.  Only the
/// distinctness of distinct inputs is relied upon.
pub fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Hostname used as a metrics label and in operator notifications.
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
