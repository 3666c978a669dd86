use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;

/// The newest segments stay on disk regardless of age or count: the highest
/// sequence may still be written and the one below it may be in detection.
const IN_FLIGHT_GUARD: usize = 2;

/// Background sweeper that bounds the chunk directory by age and count.
/// Eviction is independent of detection outcome so disk lifetime never
/// depends on model availability.
pub struct RetentionSweeper {
    dir: PathBuf,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(dir: PathBuf, config: RetentionConfig) -> Self {
        Self { dir, config }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            debug!("Retention sweeper disabled");
            return;
        }
        info!(
            "Retention sweeper started for {:?} (max age {}s, max count {})",
            self.dir, self.config.max_chunk_age_secs, self.config.max_chunks_on_disk
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match sweep_once(
                        &self.dir,
                        self.config.max_chunk_age_secs,
                        self.config.max_chunks_on_disk,
                    ) {
                        Ok(0) => {}
                        Ok(n) => debug!("Retention sweep removed {} chunk files", n),
                        Err(e) => warn!("Retention sweep failed: {}", e),
                    }
                }
            }
        }
        debug!("Retention sweeper stopped");
    }
}

/// Delete chunk files older than `max_age_secs`, then the oldest files
/// beyond `max_count`. The two highest-sequence files are never touched.
/// Returns the number of files removed.
pub(crate) fn sweep_once(
    dir: &Path,
    max_age_secs: u64,
    max_count: usize,
) -> std::io::Result<u64> {
    let segments = crate::chunker::scan_segments(dir)?;
    if segments.len() <= IN_FLIGHT_GUARD {
        return Ok(0);
    }

    // oldest first, newest IN_FLIGHT_GUARD excluded
    let mut candidates: Vec<PathBuf> = segments.into_values().collect();
    candidates.truncate(candidates.len() - IN_FLIGHT_GUARD);

    let now = SystemTime::now();
    let max_age = Duration::from_secs(max_age_secs);
    let mut removed = 0u64;
    let mut survivors = 0usize;

    // iterate newest-to-oldest so the count cap keeps the newest survivors
    for path in candidates.iter().rev() {
        let too_old = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|mtime| now.duration_since(mtime).unwrap_or_default() >= max_age)
            .unwrap_or(false);
        let over_count = survivors + IN_FLIGHT_GUARD >= max_count.max(IN_FLIGHT_GUARD);

        if too_old || over_count {
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove expired chunk {:?}: {}", path, e),
            }
        } else {
            survivors += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_chunks(dir: &Path, count: usize) {
        for seq in 0..count {
            std::fs::write(dir.join(format!("chunk_{:06}.mp4", seq)), b"x").unwrap();
        }
    }

    fn remaining(dir: &Path) -> Vec<u64> {
        crate::chunker::scan_segments(dir)
            .unwrap()
            .keys()
            .copied()
            .collect()
    }

    #[test]
    fn test_age_sweep_spares_newest_two() {
        let dir = tempfile::tempdir().unwrap();
        write_chunks(dir.path(), 5);
        // age zero makes every candidate expired
        let removed = sweep_once(dir.path(), 0, 1000).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(remaining(dir.path()), vec![3, 4]);
    }

    #[test]
    fn test_count_sweep_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        write_chunks(dir.path(), 10);
        let removed = sweep_once(dir.path(), u64::MAX, 4).unwrap();
        assert_eq!(removed, 6);
        assert_eq!(remaining(dir.path()), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_sweep_noop_when_under_limits() {
        let dir = tempfile::tempdir().unwrap();
        write_chunks(dir.path(), 3);
        let removed = sweep_once(dir.path(), u64::MAX, 100).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(remaining(dir.path()), vec![0, 1, 2]);
    }

    #[test]
    fn test_sweep_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_chunks(dir.path(), 5);
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        sweep_once(dir.path(), 0, 1000).unwrap();
        assert!(dir.path().join("notes.txt").exists());
    }
}
