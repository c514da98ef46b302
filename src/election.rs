//! Leader election over a shared filesystem.
//!
//! Replicas race for an exclusive advisory lock on `.leader.lock` in the
//! data directory. The winner publishes its `host:port` in `.leader.info`
//! and runs leader duties (GC, reconciliation, writes); losers become
//! followers, re-read the info file and re-attempt the lock on every retry
//! tick. The kernel releases the lock when the holder dies, so failover
//! needs no lease protocol: a follower wins the very next attempt.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fs2::FileExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::ElectionError;

pub const LOCK_FILE: &str = ".leader.lock";
pub const INFO_FILE: &str = ".leader.info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Standalone,
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Standalone => "standalone",
            Role::Leader => "leader",
            Role::Follower => "follower",
        };
        f.write_str(s)
    }
}

/// Shared view of the current role, readable from request handlers.
pub struct ElectionState {
    role: RwLock<Role>,
    leader_addr: RwLock<String>,
}

impl ElectionState {
    pub fn new(role: Role) -> Arc<Self> {
        Arc::new(Self {
            role: RwLock::new(role),
            leader_addr: RwLock::new(String::new()),
        })
    }

    /// Standalone deployments skip the election entirely and always serve
    /// writes themselves.
    pub fn standalone() -> Arc<Self> {
        Self::new(Role::Standalone)
    }

    pub fn role(&self) -> Role {
        *self.role.read().expect("role lock poisoned")
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role(), Role::Standalone | Role::Leader)
    }

    /// `host:port` of the current leader; empty when unknown or when the
    /// node is standalone.
    pub fn leader_addr(&self) -> String {
        self.leader_addr
            .read()
            .expect("leader addr lock poisoned")
            .clone()
    }

    fn set(&self, role: Role, leader_addr: String) {
        *self.role.write().expect("role lock poisoned") = role;
        *self.leader_addr.write().expect("leader addr lock poisoned") = leader_addr;
    }
}

/// Role-change callbacks. The election owns no background work itself;
/// starting and stopping GC, reconciliation and the refresh loop is the
/// callbacks' business.
pub struct RoleHooks {
    pub on_become_leader: Box<dyn Fn() + Send + Sync>,
    pub on_become_follower: Box<dyn Fn() + Send + Sync>,
}

impl RoleHooks {
    pub fn noop() -> Self {
        Self {
            on_become_leader: Box::new(|| {}),
            on_become_follower: Box::new(|| {}),
        }
    }
}

pub struct Election {
    data_dir: PathBuf,
    advertise_addr: String,
    retry_interval: Duration,
    state: Arc<ElectionState>,
    hooks: RoleHooks,
    lock_file: Mutex<Option<File>>,
}

impl Election {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        advertise_addr: impl Into<String>,
        retry_interval: Duration,
        hooks: RoleHooks,
    ) -> Arc<Self> {
        Self::with_state(
            data_dir,
            advertise_addr,
            retry_interval,
            ElectionState::new(Role::Follower),
            hooks,
        )
    }

    /// Build over an externally shared [`ElectionState`], so the HTTP
    /// layer can observe the role before the election task starts.
    pub fn with_state(
        data_dir: impl Into<PathBuf>,
        advertise_addr: impl Into<String>,
        retry_interval: Duration,
        state: Arc<ElectionState>,
        hooks: RoleHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.into(),
            advertise_addr: advertise_addr.into(),
            retry_interval,
            state,
            hooks,
            lock_file: Mutex::new(None),
        })
    }

    pub fn state(&self) -> Arc<ElectionState> {
        self.state.clone()
    }

    fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    fn info_path(&self) -> PathBuf {
        self.data_dir.join(INFO_FILE)
    }

    /// One non-blocking acquisition attempt. The file handle is retained
    /// while the lock is held; dropping it releases the lock.
    fn try_acquire(&self) -> Result<bool, ElectionError> {
        let mut guard = self.lock_file.lock().expect("lock file mutex poisoned");
        if guard.is_some() {
            return Ok(true);
        }

        let file = open_lock_file(&self.lock_path())?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                *guard = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn become_leader(&self) -> Result<(), ElectionError> {
        write_info_file(&self.info_path(), &self.advertise_addr)?;
        self.state.set(Role::Leader, self.advertise_addr.clone());
        info!(addr = %self.advertise_addr, "acquired leader lock, this node is now the leader");
        (self.hooks.on_become_leader)();
        Ok(())
    }

    fn become_follower(&self) {
        let leader = self.read_leader_info();
        self.state.set(Role::Follower, leader.clone());
        info!(leader = %leader, "leader lock is held elsewhere, this node is a follower");
        (self.hooks.on_become_follower)();
    }

    /// Current `.leader.info` content; empty when missing or unreadable
    /// (the previous leader may have died before ever writing it).
    fn read_leader_info(&self) -> String {
        match std::fs::read_to_string(self.info_path()) {
            Ok(s) => s.trim().to_string(),
            Err(_) => String::new(),
        }
    }

    fn refresh_leader_addr(&self) {
        let leader = self.read_leader_info();
        *self
            .state
            .leader_addr
            .write()
            .expect("leader addr lock poisoned") = leader;
    }

    /// Unlock and close the lock file. Must run before the process is
    /// hard-killed so a peer can take over without waiting on filesystem
    /// lease timeouts.
    pub fn release(&self) {
        let mut guard = self.lock_file.lock().expect("lock file mutex poisoned");
        if let Some(file) = guard.take() {
            if let Err(e) = file.unlock() {
                warn!(%e, "failed to unlock leader lock file");
            }
            info!("released leader lock");
        }
    }

    /// Drive the election until `cancel` fires. Spawned once at startup in
    /// replicated mode.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut follower_announced = false;
        loop {
            match self.try_acquire() {
                Ok(true) => {
                    if let Err(e) = self.become_leader() {
                        // Lock is ours but the info file could not be
                        // published; peers cannot find us, so step down
                        // and retry.
                        error!(%e, "failed to publish leader info, releasing lock");
                        self.release();
                    } else {
                        cancel.cancelled().await;
                        self.release();
                        return;
                    }
                }
                Ok(false) => {
                    if follower_announced {
                        self.refresh_leader_addr();
                    } else {
                        self.become_follower();
                        follower_announced = true;
                    }
                }
                Err(e) => {
                    error!(%e, "leader lock attempt failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release();
                    return;
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o640)
        .open(path)
}

#[cfg(not(unix))]
fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

/// Atomically replace `.leader.info` with `host:port`.
fn write_info_file(path: &Path, addr: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("info.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(addr.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn counting_hooks() -> (RoleHooks, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let leader_calls = Arc::new(AtomicUsize::new(0));
        let follower_calls = Arc::new(AtomicUsize::new(0));
        let l = leader_calls.clone();
        let f = follower_calls.clone();
        let hooks = RoleHooks {
            on_become_leader: Box::new(move || {
                l.fetch_add(1, Ordering::SeqCst);
            }),
            on_become_follower: Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        };
        (hooks, leader_calls, follower_calls)
    }

    #[test]
    fn standalone_reports_leader_with_empty_addr() {
        let state = ElectionState::standalone();
        assert_eq!(state.role(), Role::Standalone);
        assert!(state.is_leader());
        assert_eq!(state.leader_addr(), "");
    }

    #[tokio::test]
    async fn first_contender_wins_second_follows() {
        let dir = TempDir::new().unwrap();

        let (hooks_a, leader_a, _) = counting_hooks();
        let a = Election::new(dir.path(), "10.0.0.1:8010", Duration::from_millis(50), hooks_a);
        assert!(a.try_acquire().unwrap());
        a.become_leader().unwrap();
        assert_eq!(leader_a.load(Ordering::SeqCst), 1);
        assert!(a.state().is_leader());

        // Advisory locks conflict across descriptors, so a second
        // contender in the same process still loses.
        let (hooks_b, _, follower_b) = counting_hooks();
        let b = Election::new(dir.path(), "10.0.0.2:8010", Duration::from_millis(50), hooks_b);
        assert!(!b.try_acquire().unwrap());
        b.become_follower();
        assert_eq!(follower_b.load(Ordering::SeqCst), 1);
        assert!(!b.state().is_leader());
        assert_eq!(b.state().leader_addr(), "10.0.0.1:8010");
    }

    #[tokio::test]
    async fn follower_takes_over_after_release() {
        let dir = TempDir::new().unwrap();

        let a = Election::new(dir.path(), "10.0.0.1:8010", Duration::from_millis(20), RoleHooks::noop());
        assert!(a.try_acquire().unwrap());
        a.become_leader().unwrap();

        let (hooks_b, leader_b, _) = counting_hooks();
        let b = Election::new(dir.path(), "10.0.0.2:8010", Duration::from_millis(20), hooks_b);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(b.clone().run(cancel.clone()));

        // Let B settle into the follower role, then kill the leader.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!b.state().is_leader());
        a.release();

        // B must win within one retry tick (plus slack).
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.state().is_leader());
        assert_eq!(leader_b.load(Ordering::SeqCst), 1);

        let info = std::fs::read_to_string(dir.path().join(INFO_FILE)).unwrap();
        assert_eq!(info.trim(), "10.0.0.2:8010");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_the_lock() {
        let dir = TempDir::new().unwrap();

        let a = Election::new(dir.path(), "10.0.0.1:8010", Duration::from_millis(20), RoleHooks::noop());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(a.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(a.state().is_leader());

        cancel.cancel();
        handle.await.unwrap();

        // The lock is free again.
        let b = Election::new(dir.path(), "10.0.0.2:8010", Duration::from_millis(20), RoleHooks::noop());
        assert!(b.try_acquire().unwrap());
    }

    #[test]
    fn info_file_is_replaced_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INFO_FILE);
        write_info_file(&path, "10.0.0.1:8010").unwrap();
        write_info_file(&path, "10.0.0.2:8011").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.2:8011");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
