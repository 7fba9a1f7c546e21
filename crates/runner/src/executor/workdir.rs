use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::common::error::RunnerError;
use crate::common::hash64;

const MAX_ATTEMPTS: usize = 100;

/// Short hash used to defang user-supplied experiment keys while keeping the
/// directory names stable enough to diagnose failed experiments.
pub fn key_hash(key: &str) -> String {
    format!("{:016x}", hash64(key.as_bytes()))
}

fn signature() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect()
}

/// Claims a unique `<root>/experiments/<hash(key)>.<n>` working directory.
///
/// The smallest free instance index is probed first; ownership is confirmed
/// by planting a signature entry and re-listing, so two agents sharing the
/// same filesystem can never both claim one directory.  On a collision the
/// index moves on after a random sub-second jitter.
pub async fn make_unique_dir(root: &Path, key: &str) -> crate::Result<(PathBuf, String)> {
    let hashed = key_hash(key);
    let experiments = root.join("experiments");
    std::fs::create_dir_all(&experiments)?;

    let mut inst = 0usize;
    for _ in 0..MAX_ATTEMPTS {
        let mut dir = experiments.join(format!("{hashed}.{inst}"));
        while dir.exists() {
            log::trace!("found collision {} for {inst}", dir.display());
            inst += 1;
            dir = experiments.join(format!("{hashed}.{inst}"));
        }

        std::fs::create_dir_all(dir.join(signature()))?;

        // Only our signature present means no other entity claimed the same
        // experiment and instance
        let entries = std::fs::read_dir(&dir)?.count();
        if entries == 1 {
            return Ok((dir, format!("{hashed}.{inst}")));
        }

        log::debug!(
            "collision during creation of {} with {entries} entries",
            dir.display()
        );
        inst += 1;
        let jitter = rand::thread_rng().gen_range(0..1000);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    Err(RunnerError::Generic(format!(
        "generating a working directory for {key} failed after {MAX_ATTEMPTS} attempts"
    )))
}
