use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes regular files in `dir` last modified more than `max_age` before `now`.
///
/// Never fails: unreadable entries and failed deletions are counted and left
/// for the next pass.
pub async fn sweep_once(dir: &Path, max_age: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {:?} for cleanup: {error}", dir);
            }
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate {:?} for cleanup: {error}", dir);
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                debug!("Skipping {:?}, metadata unavailable: {error}", path);
                report.failed += 1;
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                debug!("Skipping {:?}, modification time unavailable: {error}", path);
                report.failed += 1;
                continue;
            }
        };

        // Future timestamps count as brand new.
        let age = now.duration_since(modified_at).unwrap_or(Duration::ZERO);
        if age <= max_age {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Expired {:?} after {}s", path, age.as_secs());
                report.removed += 1;
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!("Could not delete expired file {:?}: {error}", path);
                report.failed += 1;
            }
        }
    }

    report
}

/// Runs [`sweep_once`] every `interval` until `shutdown` is cancelled.
pub fn spawn_sweeper(
    dir: PathBuf,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = sweep_once(&dir, max_age, SystemTime::now()).await;
                    if report.removed > 0 || report.failed > 0 {
                        info!(
                            "Retention sweep removed {} file(s), {} failure(s)",
                            report.removed, report.failed
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);

    fn write_aged(dir: &Path, name: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"media").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn removes_only_files_past_the_threshold() {
        let dir = tempdir().unwrap();
        let old = write_aged(dir.path(), "old.mp4", Duration::from_secs(3 * 60 * 60));
        let fresh = write_aged(dir.path(), "fresh.mp4", Duration::from_secs(60 * 60));

        let report = sweep_once(dir.path(), TWO_HOURS, SystemTime::now()).await;

        assert_eq!(report, SweepReport { removed: 1, failed: 0 });
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn file_exactly_at_the_threshold_survives() {
        let dir = tempdir().unwrap();
        let path = write_aged(dir.path(), "edge.mp4", Duration::ZERO);
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let report = sweep_once(dir.path(), TWO_HOURS, modified + TWO_HOURS).await;
        assert_eq!(report, SweepReport::default());
        assert!(path.exists());

        let report = sweep_once(
            dir.path(),
            TWO_HOURS,
            modified + TWO_HOURS + Duration::from_millis(1),
        )
        .await;
        assert_eq!(report.removed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn injected_clock_ages_every_file() {
        let dir = tempdir().unwrap();
        let a = write_aged(dir.path(), "a.webm", Duration::ZERO);
        let b = write_aged(dir.path(), "b.m4a", Duration::ZERO);

        let later = SystemTime::now() + TWO_HOURS + Duration::from_secs(1);
        let report = sweep_once(dir.path(), TWO_HOURS, later).await;

        assert_eq!(report.removed, 2);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn future_modification_times_are_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("skewed.mp4");
        std::fs::write(&path, b"media").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(600))
            .unwrap();

        let report = sweep_once(dir.path(), TWO_HOURS, SystemTime::now()).await;
        assert_eq!(report.removed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn directories_are_left_alone() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        let later = SystemTime::now() + TWO_HOURS * 2;
        let report = sweep_once(dir.path(), TWO_HOURS, later).await;

        assert_eq!(report, SweepReport::default());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let dir = tempdir().unwrap();
        let report = sweep_once(&dir.path().join("absent"), TWO_HOURS, SystemTime::now()).await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn periodic_task_sweeps_and_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let old = write_aged(dir.path(), "old.mp4", Duration::from_secs(10));
        let shutdown = CancellationToken::new();

        let handle = spawn_sweeper(
            dir.path().to_path_buf(),
            Duration::from_millis(10),
            Duration::from_secs(1),
            shutdown.clone(),
        );

        for _ in 0..200 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!old.exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop after cancellation")
            .unwrap();
    }
}
