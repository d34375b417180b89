//! DescendantTracker: the driver's private table of live descendants (§4.4)
#![forbid(unsafe_code)]

use crate::internal_prelude::*;
use crate::cmdline::CmdlineExtractor;
use crate::profile::ProfileStore;

/// Cap on concurrently tracked descendants (`MAX_TRACKED_DESCENDANTS` in the original)
pub const MAX_TRACKED_DESCENDANTS: usize = 100;

/// One raw `/proc/<pid>` snapshot, as read by a [`ProcSource`]
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    /// process id
    pub pid: Pid,
    /// parent process id, from `/proc/<pid>/status`'s `PPid:`
    pub ppid: Pid,
    /// resident set size in KiB, from `/proc/<pid>/status`'s `VmRSS:`
    pub vm_rss_kib: u64,
    /// raw, NUL-joined `/proc/<pid>/cmdline` bytes
    pub cmdline_raw: Vec<u8>,
}

/// Seam over `/proc`, so tests can supply a synthetic process tree (§10.4)
pub trait ProcSource {
    /// List every numeric entry currently under `/proc`
    fn list_pids(&self) -> Result<Vec<Pid>>;
    /// Read one process's status + cmdline; `None` if it has already exited
    fn snapshot(&self, pid: Pid) -> Option<ProcSnapshot>;
}

/// [`ProcSource`] backed by the real `/proc` filesystem via the `procfs` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct RealProcSource;

impl ProcSource for RealProcSource {
    fn list_pids(&self) -> Result<Vec<Pid>> {
        let procs = procfs::process::all_processes().map_err(|e| Error::ProcUnavailable {
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        Ok(procs
            .filter_map(|p| p.ok())
            .map(|p| p.pid())
            .collect())
    }

    fn snapshot(&self, pid: Pid) -> Option<ProcSnapshot> {
        let proc = procfs::process::Process::new(pid).ok()?;
        let status = proc.status().ok()?;
        let cmdline_raw = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
        Some(ProcSnapshot {
            pid,
            ppid: status.ppid,
            vm_rss_kib: status.vmrss.unwrap_or(0),
            cmdline_raw,
        })
    }
}

/// Per-driver in-memory tracking of one live descendant process
#[derive(Debug, Clone)]
pub struct DescendantRow {
    /// tracked process id
    pub pid: Pid,
    /// index into the shared [`ProfileStore`], or `None` if no profile could be derived
    pub profile_idx: Option<usize>,
    /// current resident set size in MiB (self + recursive children)
    pub current_mb: Megabytes,
    /// high-water resident set size in MiB observed this run
    pub peak_mb: Megabytes,
    /// the profile's peak at the moment this row was created
    pub old_peak_mb: Megabytes,
}

/// Maintains [`DescendantRow`]s for one driver instance
///
/// Keyed by pid in a `BTreeMap` rather than the original's fixed array with
/// shift-left compaction: insertion, lookup, and removal are all O(log n)
/// without a compaction pass, and the tracked-count cap is enforced on
/// insert instead of by array bounds.
#[derive(Debug, Default)]
pub struct DescendantTracker {
    rows: BTreeMap<Pid, DescendantRow>,
}

/// Aggregate result of one [`DescendantTracker::scan`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanResult {
    /// total resident set size under `root_pid`, in KiB
    pub total_rss_kib: u64,
    /// number of rows that had an associated profile (tracked build steps)
    pub total_jobs: u32,
    /// Σ max(0, old_peak_mb - current_mb) across all live rows
    pub unused_peaks_mb: Megabytes,
}

impl DescendantTracker {
    /// A tracker with no rows
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of tracked rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are tracked
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a row by pid
    pub fn get(&self, pid: Pid) -> Option<&DescendantRow> {
        self.rows.get(&pid)
    }

    /// `scan(root_pid, ...)`: walk the process tree rooted at `root_pid`
    ///
    /// Builds a fresh `PPid -> children` index from `source` once, then
    /// visits each direct child's subtree. On creating a new row, releases
    /// any reservation the process held (reality supersedes prediction,
    /// §4.6) via `release_fn`.
    pub fn scan(
        &mut self,
        source: &dyn ProcSource,
        profiles: &mut ProfileStore,
        root_pid: Pid,
        mut release_fn: impl FnMut(Pid),
    ) -> Result<ScanResult> {
        let pids = source.list_pids()?;
        let mut snapshots = BTreeMap::new();
        for pid in pids {
            if let Some(snap) = source.snapshot(pid) {
                snapshots.insert(pid, snap);
            }
        }

        let mut children: BTreeMap<Pid, Vec<Pid>> = BTreeMap::new();
        for snap in snapshots.values() {
            children.entry(snap.ppid).or_default().push(snap.pid);
        }

        let mut result = ScanResult::default();
        if let Some(child_pids) = children.get(&root_pid).cloned() {
            for pid in child_pids {
                self.visit_subtree(&snapshots, &children, profiles, pid, &mut release_fn, &mut result);
            }
        }
        Ok(result)
    }

    /// Visit `pid`'s entire subtree, update/create its row using the
    /// recursive subtree RSS (self plus every descendant, §4.4 steps 4-5),
    /// and return that total in KiB so the caller one level up folds it in
    /// turn (matching `find_child_descendants`'s recursive return value).
    fn visit_subtree(
        &mut self,
        snapshots: &BTreeMap<Pid, ProcSnapshot>,
        children: &BTreeMap<Pid, Vec<Pid>>,
        profiles: &mut ProfileStore,
        pid: Pid,
        release_fn: &mut impl FnMut(Pid),
        result: &mut ScanResult,
    ) -> u64 {
        let Some(snap) = snapshots.get(&pid) else {
            return 0;
        };
        result.total_rss_kib += snap.vm_rss_kib;

        if !self.rows.contains_key(&pid) {
            if self.rows.len() >= MAX_TRACKED_DESCENDANTS {
                warn!(pid, "descendant table full, not tracking further pids");
            } else {
                let current_mb = snap.vm_rss_kib / 1024;
                let cmdline = CmdlineExtractor::cmdline_from_raw(&snap.cmdline_raw);
                let key = CmdlineExtractor::extract(&cmdline);
                let profile_idx = key.as_deref().map(|k| {
                    profiles
                        .lookup(k)
                        .unwrap_or_else(|| profiles.upsert(k, current_mb.max(1), false))
                });
                let old_peak_mb = profile_idx
                    .and_then(|idx| profiles.get(idx))
                    .map(|p| p.peak_memory_mb)
                    .unwrap_or(0);

                self.rows.insert(
                    pid,
                    DescendantRow {
                        pid,
                        profile_idx,
                        current_mb,
                        peak_mb: current_mb,
                        old_peak_mb,
                    },
                );
                release_fn(pid);
            }
        }

        let descendants_rss_kib = children
            .get(&pid)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|child| self.visit_subtree(snapshots, children, profiles, child, release_fn, result))
            .sum::<u64>();

        if let Some(row) = self.rows.get_mut(&pid) {
            let new_current_mb = (snap.vm_rss_kib + descendants_rss_kib) / 1024;
            if new_current_mb > row.current_mb {
                row.current_mb = new_current_mb;
            }
            if row.current_mb > row.peak_mb {
                row.peak_mb = row.current_mb;
                if let Some(idx) = row.profile_idx {
                    profiles.upsert(&profiles.get(idx).unwrap().filename.clone(), row.peak_mb, false);
                }
            }
            result.unused_peaks_mb += row.old_peak_mb.saturating_sub(row.current_mb);
            if row.profile_idx.is_some() {
                result.total_jobs += 1;
            }
        }

        snap.vm_rss_kib + descendants_rss_kib
    }

    /// Drop rows whose `/proc` entry has vanished, finalising their profile
    ///
    /// For each vanished row, calls `ProfileStore::upsert(.., final=true)`
    /// before removing it, per §4.4's ordering contract.
    pub fn sweep_exited(&mut self, source: &dyn ProcSource, profiles: &mut ProfileStore) {
        let live: std::collections::HashSet<Pid> = match source.list_pids() {
            Ok(pids) => pids.into_iter().collect(),
            Err(_) => return,
        };

        let exited: Vec<Pid> = self
            .rows
            .keys()
            .copied()
            .filter(|pid| !live.contains(pid) || source.snapshot(*pid).is_none())
            .collect();

        for pid in exited {
            if let Some(row) = self.rows.remove(&pid) {
                if let Some(idx) = row.profile_idx {
                    let filename = profiles.get(idx).map(|p| p.filename.clone());
                    if let Some(filename) = filename {
                        profiles.upsert(&filename, row.peak_mb, true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeProcSource {
        snapshots: BTreeMap<Pid, ProcSnapshot>,
    }

    impl FakeProcSource {
        fn new(rows: Vec<(Pid, Pid, u64, &str)>) -> Self {
            let snapshots = rows
                .into_iter()
                .map(|(pid, ppid, rss_kib, cmdline)| {
                    let mut raw: Vec<u8> = cmdline.replace(' ', "\0").into_bytes();
                    raw.push(0);
                    (
                        pid,
                        ProcSnapshot {
                            pid,
                            ppid,
                            vm_rss_kib: rss_kib,
                            cmdline_raw: raw,
                        },
                    )
                })
                .collect();
            FakeProcSource { snapshots }
        }
    }

    impl ProcSource for FakeProcSource {
        fn list_pids(&self) -> Result<Vec<Pid>> {
            Ok(self.snapshots.keys().copied().collect())
        }

        fn snapshot(&self, pid: Pid) -> Option<ProcSnapshot> {
            self.snapshots.get(&pid).cloned()
        }
    }

    #[test]
    fn scan_creates_row_and_derives_profile_key() {
        let source = FakeProcSource::new(vec![(100, 1, 51200, "g++ -o build/a.o src/a.cpp")]);
        let mut profiles = ProfileStore::new("/dev/null");
        let mut tracker = DescendantTracker::new();
        let mut released = Vec::new();

        let result = tracker
            .scan(&source, &mut profiles, 1, |pid| released.push(pid))
            .unwrap();

        assert_eq!(result.total_jobs, 1);
        assert_eq!(released, vec![100]);
        let row = tracker.get(100).unwrap();
        assert!(row.profile_idx.is_some());
        assert_eq!(
            profiles.get(row.profile_idx.unwrap()).unwrap().filename,
            "src/a.cpp"
        );
    }

    #[test]
    fn scan_aggregates_child_rss_into_parent() {
        let source = FakeProcSource::new(vec![
            (100, 1, 10240, "make"),
            (101, 100, 20480, "g++ -c src/b.cc"),
        ]);
        let mut profiles = ProfileStore::new("/dev/null");
        let mut tracker = DescendantTracker::new();
        tracker.scan(&source, &mut profiles, 1, |_| {}).unwrap();

        let parent = tracker.get(100).unwrap();
        // 10240 (self) + 20480 (child) KiB = 30 MiB
        assert_eq!(parent.current_mb, 30);
    }

    #[test]
    fn scan_aggregates_grandchild_rss_through_intermediate_row() {
        // make -> sh -> cc1plus: the middle row (sh) must report its own
        // RSS plus the grandchild's, not just its own.
        let source = FakeProcSource::new(vec![
            (100, 1, 5120, "make"),
            (101, 100, 2048, "sh -c g++ -c src/c.cpp"),
            (102, 101, 40960, "cc1plus src/c.cpp"),
        ]);
        let mut profiles = ProfileStore::new("/dev/null");
        let mut tracker = DescendantTracker::new();
        tracker.scan(&source, &mut profiles, 1, |_| {}).unwrap();

        // 2048 (self) + 40960 (grandchild) KiB = 42 MiB
        assert_eq!(tracker.get(101).unwrap().current_mb, 42);
        // 5120 (self) + 2048 + 40960 (entire subtree) KiB = 46 MiB
        assert_eq!(tracker.get(100).unwrap().current_mb, 46);
    }

    #[test]
    fn sweep_exited_finalises_and_removes() {
        let source = FakeProcSource::new(vec![(100, 1, 51200, "g++ -c src/a.cpp")]);
        let mut profiles = ProfileStore::new("/dev/null");
        let mut tracker = DescendantTracker::new();
        tracker.scan(&source, &mut profiles, 1, |_| {}).unwrap();

        let empty = FakeProcSource::new(vec![]);
        tracker.sweep_exited(&empty, &mut profiles);

        assert!(tracker.is_empty());
        let idx = profiles.lookup("src/a.cpp").unwrap();
        assert_eq!(profiles.get(idx).unwrap().peak_memory_mb, 50);
    }

    #[test]
    fn respects_tracked_descendant_cap() {
        let rows: Vec<(Pid, Pid, u64, &str)> = (1..=(MAX_TRACKED_DESCENDANTS as Pid + 5))
            .map(|pid| (pid, 0, 1024, "job"))
            .collect();
        let source = FakeProcSource::new(rows);
        let mut profiles = ProfileStore::new("/dev/null");
        let mut tracker = DescendantTracker::new();
        tracker.scan(&source, &mut profiles, 0, |_| {}).unwrap();
        assert_eq!(tracker.len(), MAX_TRACKED_DESCENDANTS);
    }
}
