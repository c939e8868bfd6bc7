//! Debounced write-back of the cookie index.
//!
//! Mutations call [`PersistenceScheduler::mark_dirty`]. The first one moves the scheduler from
//! `Clean` to `Pending` and spawns a timer task; every later one pushes the deadline out again,
//! so a burst of writes ends in a single rewrite once the store has been quiet for `delay`.
//! [`PersistenceScheduler::flush`] cancels the timer and writes immediately.
//!
//! ```text
//!            mark_dirty                 mark_dirty (deadline = now + delay)
//!   Clean ──────────────▶ Pending ◀───────────────┐
//!     ▲                     │  └──────────────────┘
//!     │   deadline / flush  │
//!     └─────────────────────┘  (state cleared, then full rewrite)
//! ```
//!
//! A failed write is logged and reported as [`StoreEvent::PersistFailed`], but the state stays
//! `Clean`: nothing is retried until the next mutation. Until then the file can lag behind the
//! in-memory index.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, StoreId};
use crate::runtime::StoreRuntime;

/// Serialized form of the whole index, ready to be written.
pub(crate) struct Snapshot {
    pub bytes: Vec<u8>,
    pub records: usize,
}

/// Something that can produce a full snapshot of the index on demand.
pub(crate) trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<Snapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Clean,
    Pending { deadline: Instant },
}

struct Slot {
    state: SchedulerState,
    timer: Option<CancellationToken>,
}

struct Shared {
    store_id: StoreId,
    path: PathBuf,
    delay: Duration,
    slot: Mutex<Slot>,
    /// Serializes snapshot + write so an older snapshot never lands after a newer one.
    write_lock: Mutex<()>,
    bus: Arc<EventBus>,
}

pub struct PersistenceScheduler {
    shared: Arc<Shared>,
    runtime: StoreRuntime,
}

impl std::fmt::Debug for PersistenceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceScheduler")
            .field("path", &self.shared.path)
            .field("delay", &self.shared.delay)
            .field("state", &self.state())
            .finish()
    }
}

impl PersistenceScheduler {
    pub(crate) fn new(
        store_id: StoreId,
        path: PathBuf,
        delay: Duration,
        runtime: StoreRuntime,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store_id,
                path,
                delay,
                slot: Mutex::new(Slot {
                    state: SchedulerState::Clean,
                    timer: None,
                }),
                write_lock: Mutex::new(()),
                bus,
            }),
            runtime,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.slot.lock().state
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Records a mutation. Schedules a write `delay` from now, replacing any earlier deadline.
    pub(crate) fn mark_dirty(&self, source: Arc<dyn SnapshotSource>) {
        let deadline = Instant::now() + self.shared.delay;

        let token = {
            let mut slot = self.shared.slot.lock();
            let was_clean = slot.state == SchedulerState::Clean;
            slot.state = SchedulerState::Pending { deadline };
            if !was_clean {
                return;
            }

            let token = CancellationToken::new();
            slot.timer = Some(token.clone());
            token
        };

        self.runtime
            .handle()
            .spawn(run_timer(self.shared.clone(), source, token));
    }

    /// Writes the snapshot now if a write is pending. Returns whether a write happened.
    ///
    /// Also waits for a scheduled write that is already in progress, so the file is current
    /// when this returns.
    pub(crate) fn flush(&self, source: &dyn SnapshotSource) -> Result<bool> {
        self.shared.flush(source)
    }

    pub(crate) async fn flush_async(&self, source: Arc<dyn SnapshotSource>) -> Result<bool> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.flush(source.as_ref()))
            .await
            .map_err(|e| StoreError::Runtime(e.to_string()))?
    }
}

enum Fire {
    Written,
    Reschedule,
    Cancelled,
}

impl Shared {
    fn flush(&self, source: &dyn SnapshotSource) -> Result<bool> {
        let _write = self.write_lock.lock();

        {
            let mut slot = self.slot.lock();
            if slot.state == SchedulerState::Clean {
                return Ok(false);
            }
            slot.state = SchedulerState::Clean;
            if let Some(timer) = slot.timer.take() {
                timer.cancel();
            }
        }

        self.write(source).map(|_| true)
    }

    fn fire(&self, source: &dyn SnapshotSource, token: &CancellationToken) -> Fire {
        let _write = self.write_lock.lock();

        {
            let mut slot = self.slot.lock();
            if token.is_cancelled() {
                return Fire::Cancelled;
            }
            match slot.state {
                SchedulerState::Pending { deadline } if deadline <= Instant::now() => {
                    slot.state = SchedulerState::Clean;
                    slot.timer = None;
                }
                SchedulerState::Pending { .. } => return Fire::Reschedule,
                SchedulerState::Clean => return Fire::Cancelled,
            }
        }

        // Failures are already logged and published by write()
        let _ = self.write(source);
        Fire::Written
    }

    fn write(&self, source: &dyn SnapshotSource) -> Result<usize> {
        let result = source.snapshot().and_then(|snapshot| {
            write_atomically(&self.path, &snapshot.bytes)?;
            Ok(snapshot.records)
        });

        match &result {
            Ok(records) => {
                debug!(
                    "CookieStore[{}]: wrote {} cookies to {}",
                    self.store_id,
                    records,
                    self.path.display()
                );
                self.bus.publish(StoreEvent::Persisted { records: *records });
            }
            Err(e) => {
                error!(
                    "CookieStore[{}]: cannot write {}: {}",
                    self.store_id,
                    self.path.display(),
                    e
                );
                self.bus.publish(StoreEvent::PersistFailed {
                    error: e.to_string(),
                });
            }
        }

        result
    }
}

async fn run_timer(shared: Arc<Shared>, source: Arc<dyn SnapshotSource>, token: CancellationToken) {
    loop {
        let deadline = match shared.slot.lock().state {
            SchedulerState::Pending { deadline } => deadline,
            SchedulerState::Clean => return,
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        // The deadline may have moved while we slept
        if let SchedulerState::Pending { deadline } = shared.slot.lock().state {
            if deadline > Instant::now() {
                continue;
            }
        }

        let fire_shared = shared.clone();
        let fire_source = source.clone();
        let fire_token = token.clone();
        let fired = tokio::task::spawn_blocking(move || {
            fire_shared.fire(fire_source.as_ref(), &fire_token)
        })
        .await;

        match fired {
            Ok(Fire::Reschedule) => continue,
            Ok(Fire::Written) | Ok(Fire::Cancelled) => return,
            Err(e) => {
                error!("CookieStore[{}]: write task failed: {}", shared.store_id, e);
                return;
            }
        }
    }
}

/// Replaces the file at `path` with `bytes`, creating missing parent directories.
///
/// Data goes to a temporary file next to the target which is then renamed over it, so readers
/// see either the old or the new contents.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;

    /// Snapshot source that counts how often it was asked for a snapshot.
    struct Counter {
        snapshots: AtomicUsize,
        payload: Mutex<String>,
    }

    impl Counter {
        fn new(payload: &str) -> Arc<Self> {
            Arc::new(Self {
                snapshots: AtomicUsize::new(0),
                payload: Mutex::new(payload.to_string()),
            })
        }

        fn count(&self) -> usize {
            self.snapshots.load(Ordering::SeqCst)
        }
    }

    impl SnapshotSource for Counter {
        fn snapshot(&self) -> Result<Snapshot> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            Ok(Snapshot {
                bytes: self.payload.lock().clone().into_bytes(),
                records: 1,
            })
        }
    }

    fn scheduler(path: PathBuf, delay_ms: u64) -> PersistenceScheduler {
        PersistenceScheduler::new(
            StoreId::new(),
            path,
            Duration::from_millis(delay_ms),
            StoreRuntime::from_handle(Handle::current()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn burst_of_marks_produces_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let sched = scheduler(path.clone(), 50);
        let source = Counter::new("{\"v\":2}");

        for _ in 0..5 {
            sched.mark_dirty(source.clone());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(sched.state(), SchedulerState::Pending { .. }));
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(sched.state(), SchedulerState::Clean);
        assert_eq!(source.count(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");
    }

    #[tokio::test]
    async fn mark_dirty_pushes_the_deadline_out() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path().join("c.json"), 60);
        let source = Counter::new("{}");

        sched.mark_dirty(source.clone());
        let first = match sched.state() {
            SchedulerState::Pending { deadline } => deadline,
            SchedulerState::Clean => panic!("expected pending"),
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        sched.mark_dirty(source.clone());
        let second = match sched.state() {
            SchedulerState::Pending { deadline } => deadline,
            SchedulerState::Clean => panic!("expected pending"),
        };

        assert!(second > first);
    }

    #[tokio::test]
    async fn flush_writes_immediately_and_cancels_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/cookies.json");
        let sched = scheduler(path.clone(), 10_000);
        let source = Counter::new("{\"flushed\":true}");

        sched.mark_dirty(source.clone());
        assert!(sched.flush(source.as_ref()).unwrap());

        assert_eq!(sched.state(), SchedulerState::Clean);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"flushed\":true}"
        );

        // Clean flush is a no-op
        assert!(!sched.flush(source.as_ref()).unwrap());
        assert_eq!(source.count(), 1);
    }

    #[tokio::test]
    async fn flush_async_writes_pending_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let sched = scheduler(path.clone(), 10_000);
        let source = Counter::new("{}");

        assert!(!sched.flush_async(source.clone()).await.unwrap());
        sched.mark_dirty(source.clone());
        assert!(sched.flush_async(source.clone()).await.unwrap());
        assert!(path.exists());
        assert_eq!(source.count(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"a regular file").unwrap();

        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let sched = PersistenceScheduler::new(
            StoreId::new(),
            blocker.join("cookies.json"),
            Duration::from_millis(20),
            StoreRuntime::from_handle(Handle::current()),
            bus.clone(),
        );
        let source = Counter::new("{}");

        sched.mark_dirty(source.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(sched.state(), SchedulerState::Clean);
        assert!(matches!(
            events.try_recv(),
            Ok(StoreEvent::PersistFailed { .. })
        ));

        // No retry happens on its own
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn write_atomically_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_atomically(&path, b"first version, quite long").unwrap();
        write_atomically(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
