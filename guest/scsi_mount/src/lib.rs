// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted registry of SCSI device mounts inside the guest.
//!
//! The manager guarantees at most one mount attempt per
//! `(controller, lun, config)` key: concurrent callers for the same key are
//! deduplicated onto a single in-flight attempt and all observe the pioneer's
//! outcome. Guest paths are assigned from a stable table index when the
//! caller does not supply one, and the underlying device is released only
//! when the last reference is dropped.
//!
//! The actual device operations are delegated to a [`Mounter`], keeping
//! kernel interaction out of the bookkeeping.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Performs the physical mount and unmount of an attached SCSI device.
///
/// Implementations may block on device operations and must honor
/// cancellation at whatever granularity the kernel allows.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(
        &self,
        cancel: &CancellationToken,
        controller: u32,
        lun: u32,
        path: &Path,
        config: &MountConfig,
    ) -> anyhow::Result<()>;

    async fn unmount(
        &self,
        cancel: &CancellationToken,
        controller: u32,
        lun: u32,
        path: &Path,
        config: &MountConfig,
    ) -> anyhow::Result<()>;
}

/// How a device should be surfaced inside the guest.
///
/// Two configs compare equal independent of the order of `options`; the
/// manager sorts the slice before storing it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountConfig {
    pub partition: u64,
    pub read_only: bool,
    pub encrypted: bool,
    pub block_dev: bool,
    pub options: Vec<String>,
    pub ensure_filesystem: bool,
    pub filesystem: String,
}

/// A cloneable wrapper around an opaque mount failure, so the pioneer's
/// outcome can be broadcast to every deduplicated caller.
#[derive(Clone, Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.chain().nth(1)
    }
}

#[derive(Clone, Debug, Error)]
pub enum MountError {
    #[error("cannot mount over an existing mountpoint: {}", .0.display())]
    PathConflict(PathBuf),
    #[error("no mount tracked at {}", .0.display())]
    NotMounted(PathBuf),
    #[error("mount scsi controller {controller} lun {lun} at {}: {source}", path.display())]
    Mount {
        controller: u32,
        lun: u32,
        path: PathBuf,
        #[source]
        source: SharedError,
    },
    #[error("unmount scsi controller {controller} lun {lun} at {}: {source}", path.display())]
    Unmount {
        controller: u32,
        lun: u32,
        path: PathBuf,
        #[source]
        source: SharedError,
    },
    #[error("mount cancelled")]
    Cancelled,
}

// Readiness of a mount entry: `None` while the pioneer's attempt is in
// flight, then exactly one of success or the pioneer's error.
type ReadyState = Option<Result<(), MountError>>;

struct MountEntry {
    path: PathBuf,
    index: usize,
    controller: u32,
    lun: u32,
    config: MountConfig,
    readiness: watch::Receiver<ReadyState>,
}

struct MountSlot {
    entry: Arc<MountEntry>,
    ref_count: usize,
}

// Entries are None once unmounted, meaning the index is available for use.
#[derive(Default)]
struct MountTable {
    mounts: Vec<Option<MountSlot>>,
}

impl MountTable {
    fn find_by_path(&mut self, path: &Path) -> Option<&mut MountSlot> {
        self.mounts
            .iter_mut()
            .flatten()
            .find(|slot| slot.entry.path == path)
    }
}

enum Tracked {
    Existing(Arc<MountEntry>),
    New {
        entry: Arc<MountEntry>,
        publish: watch::Sender<ReadyState>,
    },
}

/// The mount registry. All bookkeeping happens under a single table mutex;
/// callers awaiting another caller's in-flight mount hold only a readiness
/// receiver.
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
    table: Mutex<MountTable>,
    mount_root: PathBuf,
}

impl MountManager {
    /// `mount_root` is the directory under which generated mount paths are
    /// assigned, one per table index (`<mount_root>/0`, `<mount_root>/1`, …).
    pub fn new(mounter: Arc<dyn Mounter>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mounter,
            table: Mutex::new(MountTable::default()),
            mount_root: mount_root.into(),
        }
    }

    fn path_for_index(&self, index: usize) -> PathBuf {
        self.mount_root.join(index.to_string())
    }

    /// Ensures the device at `(controller, lun)` is mounted with `config` and
    /// returns the guest path, incrementing the entry's reference count.
    ///
    /// If a key-equal entry already exists (or is in flight), no new mount is
    /// attempted; the call waits for that entry's outcome. Cancellation while
    /// waiting rolls back this caller's reference only, leaving the pioneer
    /// undisturbed.
    pub async fn mount(
        &self,
        cancel: &CancellationToken,
        controller: u32,
        lun: u32,
        path: Option<&Path>,
        mut config: MountConfig,
    ) -> Result<PathBuf, MountError> {
        // Normalize for comparison: config equality is element-wise over the
        // options, and option order never matters to the kernel.
        config.options.sort_unstable();

        let tracked = {
            let mut table = self.table.lock().await;
            self.track_mount(&mut table, controller, lun, path, config)?
        };

        match tracked {
            Tracked::Existing(entry) => {
                let mut readiness = entry.readiness.clone();
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        self.rollback(&entry).await;
                        return Err(MountError::Cancelled);
                    }
                    res = async {
                        readiness.wait_for(|state| state.is_some()).await.map(|state| state.clone())
                    } => res,
                };
                match outcome {
                    Ok(state) => state
                        .expect("readiness published")
                        .map(|()| entry.path.clone()),
                    // The pioneer was dropped without publishing; the entry
                    // is unusable.
                    Err(_) => {
                        self.rollback(&entry).await;
                        Err(MountError::Mount {
                            controller: entry.controller,
                            lun: entry.lun,
                            path: entry.path.clone(),
                            source: SharedError::new(anyhow::anyhow!("mount attempt abandoned")),
                        })
                    }
                }
            }
            Tracked::New { entry, publish } => {
                tracing::debug!(
                    controller,
                    lun,
                    path = %entry.path.display(),
                    "mounting scsi device"
                );
                let result = self
                    .mounter
                    .mount(cancel, controller, lun, &entry.path, &entry.config)
                    .await;
                match result {
                    Ok(()) => {
                        publish.send_replace(Some(Ok(())));
                        Ok(entry.path.clone())
                    }
                    Err(err) => {
                        let err = MountError::Mount {
                            controller,
                            lun,
                            path: entry.path.clone(),
                            source: SharedError::new(err),
                        };
                        // Remove the entry before publishing so no subsequent
                        // caller can pick up a ghost entry.
                        {
                            let mut table = self.table.lock().await;
                            table.mounts[entry.index] = None;
                        }
                        publish.send_replace(Some(Err(err.clone())));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Drops one reference to the entry mounted at `path`. The last reference
    /// releases the underlying device.
    ///
    /// A failed physical unmount still untracks the entry: the device may be
    /// in a state only the host can reconcile, and retrying against a stale
    /// entry would mask that.
    pub async fn unmount(&self, cancel: &CancellationToken, path: &Path) -> Result<(), MountError> {
        let mut table = self.table.lock().await;
        let slot = table
            .find_by_path(path)
            .ok_or_else(|| MountError::NotMounted(path.to_path_buf()))?;

        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return Ok(());
        }

        let entry = slot.entry.clone();
        tracing::debug!(
            controller = entry.controller,
            lun = entry.lun,
            path = %entry.path.display(),
            "unmounting scsi device"
        );
        let result = self
            .mounter
            .unmount(cancel, entry.controller, entry.lun, &entry.path, &entry.config)
            .await;
        table.mounts[entry.index] = None;
        result.map_err(|err| MountError::Unmount {
            controller: entry.controller,
            lun: entry.lun,
            path: entry.path.clone(),
            source: SharedError::new(err),
        })
    }

    fn track_mount(
        &self,
        table: &mut MountTable,
        controller: u32,
        lun: u32,
        path: Option<&Path>,
        config: MountConfig,
    ) -> Result<Tracked, MountError> {
        let mut free_index = None;
        for (index, slot) in table.mounts.iter_mut().enumerate() {
            match slot {
                None => {
                    if free_index.is_none() {
                        free_index = Some(index);
                    }
                }
                Some(slot) => {
                    if controller == slot.entry.controller
                        && lun == slot.entry.lun
                        && config == slot.entry.config
                    {
                        slot.ref_count += 1;
                        return Ok(Tracked::Existing(slot.entry.clone()));
                    } else if let Some(path) = path.filter(|path| *path == slot.entry.path) {
                        return Err(MountError::PathConflict(path.to_path_buf()));
                    }
                }
            }
        }

        let index = free_index.unwrap_or(table.mounts.len());
        let path = match path {
            Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
            // Use the mount index to produce a unique guest path.
            _ => self.path_for_index(index),
        };
        let (publish, readiness) = watch::channel(None);
        let entry = Arc::new(MountEntry {
            path,
            index,
            controller,
            lun,
            config,
            readiness,
        });
        let slot = MountSlot {
            entry: entry.clone(),
            ref_count: 1,
        };
        if index == table.mounts.len() {
            table.mounts.push(Some(slot));
        } else {
            table.mounts[index] = Some(slot);
        }
        Ok(Tracked::New { entry, publish })
    }

    // Undoes one caller's reference after it gave up waiting. If that was the
    // last reference to an entry that already mounted successfully, the
    // release path runs here so the cancelled caller never leaks a mount it
    // could not observe.
    async fn rollback(&self, entry: &Arc<MountEntry>) {
        let mut table = self.table.lock().await;
        let Some(Some(slot)) = table.mounts.get_mut(entry.index) else {
            return;
        };
        if !Arc::ptr_eq(&slot.entry, entry) {
            return;
        }
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return;
        }
        let mounted = matches!(*entry.readiness.borrow(), Some(Ok(())));
        table.mounts[entry.index] = None;
        if mounted {
            let cancel = CancellationToken::new();
            if let Err(err) = self
                .mounter
                .unmount(&cancel, entry.controller, entry.lun, &entry.path, &entry.config)
                .await
            {
                tracing::warn!(
                    error = %err,
                    path = %entry.path.display(),
                    "failed to release mount after cancelled waiter"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    /// A mounter that records calls and can hold mount attempts at a gate
    /// until the test releases them.
    #[derive(Default)]
    struct FakeMounter {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
        mounted_paths: SyncMutex<Vec<PathBuf>>,
        gate: Option<Notify>,
        entered: Option<Notify>,
        fail_mounts: AtomicUsize,
    }

    impl FakeMounter {
        fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                entered: Some(Notify::new()),
                ..Default::default()
            }
        }

        fn failing(times: usize) -> Self {
            let mounter = Self::default();
            mounter.fail_mounts.store(times, Ordering::SeqCst);
            mounter
        }
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount(
            &self,
            _cancel: &CancellationToken,
            _controller: u32,
            _lun: u32,
            path: &Path,
            _config: &MountConfig,
        ) -> anyhow::Result<()> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            if let Some(entered) = &self.entered {
                entered.notify_one();
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self
                .fail_mounts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("device error");
            }
            self.mounted_paths.lock().push(path.to_path_buf());
            Ok(())
        }

        async fn unmount(
            &self,
            _cancel: &CancellationToken,
            _controller: u32,
            _lun: u32,
            _path: &Path,
            _config: &MountConfig,
        ) -> anyhow::Result<()> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(read_only: bool, options: &[&str]) -> MountConfig {
        MountConfig {
            read_only,
            options: options.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn manager(mounter: Arc<FakeMounter>) -> MountManager {
        MountManager::new(mounter, "/mnt/scsi")
    }

    #[tokio::test]
    async fn concurrent_mounts_deduplicate() {
        let mounter = Arc::new(FakeMounter::gated());
        let manager = Arc::new(manager(mounter.clone()));
        let cancel = CancellationToken::new();

        let first = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move {
                manager
                    .mount(&cancel, 0, 3, None, config(true, &["noatime", "ro"]))
                    .await
            }
        });
        mounter.entered.as_ref().unwrap().notified().await;

        // Same key, differently ordered options: must wait on the pioneer
        // rather than race it.
        let second = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move {
                manager
                    .mount(&cancel, 0, 3, None, config(true, &["ro", "noatime"]))
                    .await
            }
        });
        tokio::task::yield_now().await;
        mounter.gate.as_ref().unwrap().notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, PathBuf::from("/mnt/scsi/0"));
        assert_eq!(second, PathBuf::from("/mnt/scsi/0"));
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refcount_releases_device_once() {
        let mounter = Arc::new(FakeMounter::default());
        let manager = manager(mounter.clone());
        let cancel = CancellationToken::new();
        let cfg = config(true, &["ro"]);

        let path = manager.mount(&cancel, 0, 3, None, cfg.clone()).await.unwrap();
        manager.mount(&cancel, 0, 3, None, cfg).await.unwrap();
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);

        manager.unmount(&cancel, &path).await.unwrap();
        assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 0);
        manager.unmount(&cancel, &path).await.unwrap();
        assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);

        let err = manager.unmount(&cancel, &path).await.unwrap_err();
        assert!(matches!(err, MountError::NotMounted(_)));
    }

    #[tokio::test]
    async fn path_conflict_rejected() {
        let mounter = Arc::new(FakeMounter::default());
        let manager = manager(mounter.clone());
        let cancel = CancellationToken::new();

        let path = Path::new("/mnt/x");
        manager
            .mount(&cancel, 0, 1, Some(path), config(false, &[]))
            .await
            .unwrap();
        let err = manager
            .mount(&cancel, 0, 2, Some(path), config(false, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::PathConflict(_)));
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);

        // The failed call must not have altered the table.
        manager.unmount(&cancel, path).await.unwrap();
        assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_mount_leaves_no_ghost_entry() {
        let mounter = Arc::new(FakeMounter::failing(1));
        let manager = manager(mounter.clone());
        let cancel = CancellationToken::new();
        let cfg = config(false, &[]);

        let err = manager
            .mount(&cancel, 0, 0, None, cfg.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::Mount { .. }));

        // The entry is gone, so the next mount attempts the device again.
        let path = manager.mount(&cancel, 0, 0, None, cfg).await.unwrap();
        assert_eq!(path, PathBuf::from("/mnt/scsi/0"));
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiters_observe_pioneer_failure() {
        let mounter = Arc::new(FakeMounter::gated());
        mounter.fail_mounts.store(1, Ordering::SeqCst);
        let manager = Arc::new(manager(mounter.clone()));
        let cancel = CancellationToken::new();

        let pioneer = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.mount(&cancel, 1, 1, None, config(false, &[])).await }
        });
        mounter.entered.as_ref().unwrap().notified().await;
        let waiter = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.mount(&cancel, 1, 1, None, config(false, &[])).await }
        });
        tokio::task::yield_now().await;
        mounter.gate.as_ref().unwrap().notify_one();

        assert!(pioneer.await.unwrap().is_err());
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_rolls_back_reference() {
        let mounter = Arc::new(FakeMounter::gated());
        let manager = Arc::new(manager(mounter.clone()));
        let cancel = CancellationToken::new();

        let pioneer = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.mount(&cancel, 0, 3, None, config(true, &[])).await }
        });
        mounter.entered.as_ref().unwrap().notified().await;

        let waiter_cancel = CancellationToken::new();
        let waiter = tokio::spawn({
            let manager = manager.clone();
            let waiter_cancel = waiter_cancel.clone();
            async move { manager.mount(&waiter_cancel, 0, 3, None, config(true, &[])).await }
        });
        tokio::task::yield_now().await;
        waiter_cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MountError::Cancelled));

        // The pioneer is not cancelled, and its reference alone remains.
        mounter.gate.as_ref().unwrap().notify_one();
        let path = pioneer.await.unwrap().unwrap();
        manager.unmount(&cancel, &path).await.unwrap();
        assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn freed_index_is_reused_lowest_first() {
        let mounter = Arc::new(FakeMounter::default());
        let manager = manager(mounter.clone());
        let cancel = CancellationToken::new();

        for lun in 0..3 {
            let path = manager
                .mount(&cancel, 0, lun, None, config(false, &[]))
                .await
                .unwrap();
            assert_eq!(path, PathBuf::from(format!("/mnt/scsi/{lun}")));
        }
        manager
            .unmount(&cancel, Path::new("/mnt/scsi/1"))
            .await
            .unwrap();

        let path = manager
            .mount(&cancel, 0, 9, None, config(false, &[]))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/mnt/scsi/1"));
        let seen = mounter.mounted_paths.lock().clone();
        assert_eq!(
            seen,
            ["/mnt/scsi/0", "/mnt/scsi/1", "/mnt/scsi/2", "/mnt/scsi/1"]
                .map(PathBuf::from)
        );
    }

    proptest! {
        // Option order must not defeat deduplication, and differing options
        // must defeat it.
        #[test]
        fn option_order_insensitive_dedup(mut options in prop::collection::vec("[a-z]{1,8}", 0..6)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mounter = Arc::new(FakeMounter::default());
                let manager = manager(mounter.clone());
                let cancel = CancellationToken::new();

                let forward = config(false, &options.iter().map(|s| s.as_str()).collect::<Vec<_>>());
                options.reverse();
                let reversed = config(false, &options.iter().map(|s| s.as_str()).collect::<Vec<_>>());

                manager.mount(&cancel, 0, 0, None, forward).await.unwrap();
                manager.mount(&cancel, 0, 0, None, reversed).await.unwrap();
                prop_assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);

                let mut distinct = config(false, &[]);
                distinct.options = vec!["something-else".to_string()];
                manager.mount(&cancel, 0, 0, None, distinct).await.unwrap();
                prop_assert_eq!(mounter.mounts.load(Ordering::SeqCst), 2);
                Ok(())
            })?;
        }
    }
}
