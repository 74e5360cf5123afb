use crate::{config::Config, lease::Leases};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Deletes files older than the retention window from the watched
/// directories. Only direct children that are regular files are considered.
#[derive(Clone)]
pub struct Janitor {
    dirs: Vec<PathBuf>,
    retention: Duration,
    scan_interval: Duration,
    leases: Leases,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub retained: usize,
    /// Expired but currently being served; retried on the next scan.
    pub leased: usize,
    pub failed: usize,
}

impl Janitor {
    pub fn new(
        dirs: Vec<PathBuf>,
        retention: Duration,
        scan_interval: Duration,
        leases: Leases,
    ) -> Self {
        Self {
            dirs,
            retention,
            scan_interval,
            leases,
        }
    }

    pub fn from_config(cfg: &Config, leases: Leases) -> Self {
        Self::new(
            cfg.watched_dirs(),
            cfg.janitor.retention,
            cfg.janitor.scan_interval,
            leases,
        )
    }

    /// Scan every watched directory once, treating `now` as the current time.
    pub fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        for dir in &self.dirs {
            self.sweep_dir(dir, now, &mut report);
        }
        report
    }

    fn sweep_dir(&self, dir: &Path, now: SystemTime, report: &mut SweepReport) {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "watched directory missing, skipping");
            return;
        }
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to read entry");
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.scanned += 1;
            let path = entry.path();
            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "no modification time");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat file");
                    report.failed += 1;
                    continue;
                }
            };
            // mtime in the future counts as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.retention {
                report.retained += 1;
                continue;
            }
            match self
                .leases
                .remove_unless_leased(path, |p| std::fs::remove_file(p))
            {
                None => {
                    debug!(path = %path.display(), "expired file is being served, keeping");
                    report.leased += 1;
                }
                Some(Ok(())) => {
                    info!(path = %path.display(), age_secs = age.as_secs(), "removed expired file");
                    report.removed += 1;
                }
                Some(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "failed to remove expired file");
                    report.failed += 1;
                }
            }
        }
    }

    /// Sweep immediately, then once per scan interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.scan_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let janitor = self.clone();
                match tokio::task::spawn_blocking(move || janitor.sweep(SystemTime::now())).await {
                    Ok(report) => debug!(?report, "janitor sweep finished"),
                    Err(e) => warn!(error = %e, "janitor sweep panicked"),
                }
            }
            info!("janitor stopped");
        })
    }
}
