//! ReservationController: the job-admission hook (§4.6)
//!
//! Exposed to the surrounding job launcher. Every operation here is
//! infallible by construction (§7, §10.2): a missing shared region or a
//! full reservation table degrades to "nothing reserved" rather than
//! propagating an error the launcher would have to handle.
#![forbid(unsafe_code)]

use crate::internal_prelude::*;
use crate::profile::ProfileStore;
use crate::shared_region::SharedRegion;

/// The admission hook handed to the surrounding job launcher
pub struct ReservationController {
    shared_region: Arc<SharedRegion>,
}

impl ReservationController {
    /// Wrap an attached [`SharedRegion`]
    pub fn new(shared_region: Arc<SharedRegion>) -> Self {
        ReservationController { shared_region }
    }

    /// `reserve(pid, mb, tag)`
    ///
    /// - `mb == 0`: release any slot held for `pid`. Returns `true` iff a
    ///   slot was found and freed (the simplified contract this crate
    ///   takes per §9's Open Question, rather than the original's signed
    ///   "did this exactly cancel" semantics).
    /// - `mb > 0`: locate or create the slot, set `reserved_mb = mb`,
    ///   adjust the global total by the signed delta. Returns `true`
    ///   unless the table was full.
    pub fn reserve(&self, pid: Pid, mb: Megabytes, tag: &str) -> bool {
        if mb == 0 {
            let Some(slot) = self.shared_region.find_slot(pid) else {
                return false;
            };
            let old = self.shared_region.reservation_at(slot).reserved_mb;
            self.shared_region.set_slot_mb(slot, 0);
            self.shared_region.free_slot(slot);
            self.shared_region.adjust_total_reserved(old, 0);
            trace!(pid, old, "released reservation");
            return true;
        }

        let slot = match self.shared_region.find_or_create_slot(pid) {
            Ok(slot) => slot,
            Err(err) => {
                warn!(%err, pid, tag, "could not reserve memory for job");
                return false;
            }
        };
        let old = self.shared_region.set_slot_mb(slot, mb);
        self.shared_region.adjust_total_reserved(old, mb);
        info!(pid, tag, old, new = mb, "reserved memory for job");
        true
    }

    /// `get_imminent_mb() = total_reserved + unused_peaks`
    ///
    /// Best-effort: the two reads aren't taken under a single lock, matching
    /// §4.2's "eventually consistent" contract for readers.
    pub fn get_imminent_mb(&self) -> Megabytes {
        self.shared_region.total_reserved_mb() + self.shared_region.unused_peaks_mb()
    }

    /// `predict_for(filename)`: the file's known peak, or 0 if unknown
    pub fn predict_for(&self, profiles: &ProfileStore, filename: &str) -> Megabytes {
        profiles
            .lookup(filename)
            .and_then(|idx| profiles.get(idx))
            .map(|p| p.peak_memory_mb)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn reserve_then_release_round_trips_total() {
        let region = Arc::new(SharedRegion::attach_or_create(true).unwrap());
        let controller = ReservationController::new(region.clone());

        assert!(controller.reserve(9001, 64, "src/a.cpp"));
        assert_eq!(region.total_reserved_mb(), 64);

        assert!(controller.reserve(9001, 0, ""));
        assert_eq!(region.total_reserved_mb(), 0);
    }

    #[test]
    #[serial]
    fn release_with_no_prior_reservation_returns_false() {
        let region = Arc::new(SharedRegion::attach_or_create(true).unwrap());
        let controller = ReservationController::new(region);
        assert!(!controller.reserve(424242, 0, ""));
    }

    #[test]
    #[serial]
    fn get_imminent_mb_sums_reserved_and_unused_peaks() {
        let region = Arc::new(SharedRegion::attach_or_create(true).unwrap());
        let controller = ReservationController::new(region.clone());
        controller.reserve(1, 10, "x");
        region.set_unused_peaks_mb(5);
        assert_eq!(controller.get_imminent_mb(), 15);
    }

    #[test]
    #[serial]
    fn predict_for_unknown_file_is_zero() {
        let profiles = ProfileStore::new("/dev/null");
        let region = Arc::new(SharedRegion::attach_or_create(true).unwrap());
        let controller = ReservationController::new(region);
        assert_eq!(controller.predict_for(&profiles, "src/unknown.c"), 0);
    }

    #[test]
    #[serial]
    fn predict_for_known_file_returns_peak() {
        let mut profiles = ProfileStore::new("/dev/null");
        profiles.upsert("src/a.cpp", 77, false);
        let region = Arc::new(SharedRegion::attach_or_create(true).unwrap());
        let controller = ReservationController::new(region);
        assert_eq!(controller.predict_for(&profiles, "src/a.cpp"), 77);
    }
}
