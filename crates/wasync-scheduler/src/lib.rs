#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-scheduler** – The periodic tick loop that drives the
//! Synchronizer across every configured world.
//!
//! A single-threaded cooperative loop: while `now() < quit_at`, iterate
//! over the configured worlds in order, drive [`wasync_engine::sync_world`]
//! for each, sleep `ping_interval`, repeat. The working tree, its three
//! registries, and the `VersionedStore` are single-writer state owned
//! exclusively by this loop — no concurrency across worlds is required
//! (spec §5), so the scheduler never spawns a task per world.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use wasync_engine::Registries;
use wasync_source::ObjectSource;
use wasync_store::VersionedStore;
use wasync_types::WorldConfig;

/// Configuration the scheduler needs beyond the worlds list itself.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Wall-clock deadline after which the loop exits cleanly.
    pub quit_at: NaiveDateTime,
    /// How long to sleep between ticks.
    pub ping_interval: Duration,
}

/// A flag an external signal handler can set to request a clean shutdown
/// at the next checkpoint between worlds. Cloneable and cheap to share
/// with a `tokio::signal::ctrl_c()` task.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a shutdown. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` once [`ShutdownFlag::request`] has been called.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Spawn a task that sets this flag when `Ctrl+C` is received.
    pub fn watch_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                flag.request();
            }
        });
    }
}

/// Drives [`wasync_engine::sync_world`] over `worlds` on a cooperative
/// tick loop until `config.quit_at` or `shutdown` is requested.
///
/// `source` and `store` are the single, shared instances every world's
/// synchronization goes through this run; `registries` similarly are
/// global to the working tree, not per-world (object identifiers are
/// unique across worlds).
pub async fn run(
    source: &dyn ObjectSource,
    store: &mut dyn VersionedStore,
    registries: &Registries,
    worlds: &[WorldConfig],
    config: &ScheduleConfig,
    shutdown: &ShutdownFlag,
) {
    registries
        .ensure_initialized()
        .expect("working tree registries must be initializable before the first tick");

    let mut tick_number: u64 = 0;
    loop {
        let now = now();
        if now >= config.quit_at || shutdown.is_requested() {
            info!(tick_number, "quit deadline or shutdown reached, exiting cleanly");
            return;
        }

        tick_number += 1;
        info!(tick_number, worlds = worlds.len(), "tick starting");

        for world in worlds {
            if shutdown.is_requested() {
                info!(tick_number, "shutdown requested mid-tick, stopping before next world");
                return;
            }

            match wasync_engine::sync_world(source, store, registries, world).await {
                Ok(report) => {
                    info!(
                        tick_number,
                        world = %world.url,
                        file_index_updated = report.file_index_updated,
                        world_changed = report.world.changed.len(),
                        categories_changed = report.categories.as_ref().map(|r| r.changed.len()).unwrap_or(0),
                        articles_changed = report.articles.as_ref().map(|r| r.changed.len()).unwrap_or(0),
                        "world synchronized"
                    );
                }
                Err(e) => {
                    warn!(tick_number, world = %world.url, error = %e, "world sync aborted this tick, will retry next tick");
                }
            }
        }

        info!(tick_number, "tick complete, sleeping");
        tokio::time::sleep(config.ping_interval).await;
    }
}

/// Thin indirection over `chrono::Local::now()` so call sites read plainly
/// as `now()` without committing the whole crate to a particular clock
/// source; swappable for a fixed clock in tests.
fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_starts_unset_and_is_idempotent() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
    }

    #[test]
    fn shutdown_flag_clones_share_state() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        clone.request();
        assert!(flag.is_requested());
    }

    #[tokio::test]
    async fn run_exits_immediately_when_deadline_already_passed() {
        use wasync_source::FixtureSource;

        let dir = tempfile::tempdir().unwrap();
        let registries = Registries::open(dir.path());
        let source = FixtureSource::new("user-1");

        struct NoopStore(std::path::PathBuf);
        impl VersionedStore for NoopStore {
            fn working_tree(&self) -> &std::path::Path {
                &self.0
            }
            fn checkout(&mut self, _branch: &str) -> wasync_store::Result<()> {
                unreachable!("run() must not touch the store before checking the deadline")
            }
            fn validate(&self) -> wasync_store::Result<()> {
                unreachable!()
            }
            fn write_object(&mut self, _id: &wasync_types::Identifier, _payload: &wasync_types::Payload) -> wasync_store::Result<()> {
                unreachable!()
            }
            fn stage(&mut self, _relative_path: &std::path::Path) -> wasync_store::Result<()> {
                unreachable!()
            }
            fn commit(&mut self, _title: &str, _body: &str) -> wasync_store::Result<Option<String>> {
                unreachable!()
            }
            fn publish(&mut self) -> wasync_store::Result<()> {
                unreachable!()
            }
        }
        let mut store = NoopStore(dir.path().to_path_buf());

        let config = ScheduleConfig {
            quit_at: chrono::NaiveDate::from_ymd_opt(2000, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            ping_interval: Duration::from_secs(60),
        };
        let shutdown = ShutdownFlag::new();

        run(&source, &mut store, &registries, &[], &config, &shutdown).await;
        // Reaching here without panicking on an `unreachable!()` proves
        // the deadline check short-circuits before any world is visited.
    }
}
