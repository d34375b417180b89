//! SharedRegion: cross-process reservation bookkeeping (§4.2)
//!
//! This is the one module in the crate that needs `unsafe`: POSIX shared
//! memory (`shm_open`/`mmap`) and process-shared pthread mutexes have no
//! safe wrapper that covers `PTHREAD_PROCESS_SHARED` attributes, so this
//! module talks to `libc` directly instead of going through a crate like
//! `nix`. Every other module in this crate stays within the teacher's
//! `#![forbid(unsafe_code)]` discipline; this one is exempted deliberately
//! (see `DESIGN.md`).

use crate::internal_prelude::*;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

/// Maximum concurrent reservation slots (`MAX_RESERVATIONS` in the original)
pub const MAX_RESERVATIONS: usize = 64;

/// POSIX shared memory object name
pub const SHARED_MEMORY_NAME: &str = "/make_memory_shared";

/// One slot in the shared reservation table
#[repr(C)]
#[derive(Clone, Copy)]
struct RawReservation {
    pid: libc::pid_t,
    reserved_mb: u64,
}

/// The page-resident, process-shared record mapped at [`SHARED_MEMORY_NAME`]
///
/// Layout is `repr(C)` because multiple independently-compiled processes
/// map the same bytes; field order and size must be stable across them.
#[repr(C)]
struct RawSharedMemoryData {
    reservation_count: u32,
    reservations: [RawReservation; MAX_RESERVATIONS],
    unused_peaks_mb: u64,
    total_reserved_mb: u64,
    reserved_count_mutex: libc::pthread_mutex_t,
    total_reserved_mb_mutex: libc::pthread_mutex_t,
}

/// An observed reservation slot: `pid == 0` means free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// owning process id, or 0 if free
    pub pid: Pid,
    /// predicted cost in MiB
    pub reserved_mb: Megabytes,
}

/// Handle to the attached shared region
///
/// Only the top-level driver should construct one with `top_level = true`;
/// sub-builds attach without zeroing and must not unlink on drop.
pub struct SharedRegion {
    fd: RawFd,
    ptr: *mut RawSharedMemoryData,
    top_level: bool,
}

// The pointed-to memory is process-shared and all accesses go through the
// embedded pthread mutexes, so it's sound to move/share the handle itself
// across threads within one process.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// `attach_or_create()`: open-or-create the named region
    ///
    /// If newly created, sizes it and initialises both process-shared
    /// mutexes. The top-level driver always zeroes the payload (preserving
    /// already-constructed mutexes when reusing an existing region);
    /// sub-builds attach without zeroing.
    pub fn attach_or_create(top_level: bool) -> Result<Self> {
        let name = CString::new(SHARED_MEMORY_NAME).expect("no interior NUL");
        let size = std::mem::size_of::<RawSharedMemoryData>();

        // SAFETY: `name` is a valid NUL-terminated C string; flags/mode are
        // the standard shm_open create-or-open combination.
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd == -1 {
            return Err(Error::SharedMemoryUnavailable {
                name: SHARED_MEMORY_NAME.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: fd is a valid, just-opened shm fd.
        let created = unsafe {
            let mut st: MaybeUninit<libc::stat> = MaybeUninit::uninit();
            if libc::fstat(fd, st.as_mut_ptr()) == -1 {
                true
            } else {
                st.assume_init().st_size == 0
            }
        };

        if created {
            // SAFETY: fd valid, size is a compile-time constant struct size.
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(Error::SharedMemoryUnavailable {
                    name: SHARED_MEMORY_NAME.to_string(),
                    source: err,
                });
            }
        }

        // SAFETY: fd valid and sized to at least `size` bytes (either just
        // truncated, or previously sized by the region's creator).
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::SharedMemoryUnavailable {
                name: SHARED_MEMORY_NAME.to_string(),
                source: err,
            });
        }
        let ptr = ptr as *mut RawSharedMemoryData;

        if top_level {
            // SAFETY: ptr is a valid, page-sized mapping of the right layout.
            // Zero only the payload fields, not the trailing mutexes: on the
            // reuse path (created == false) the mutexes are already
            // `pthread_mutex_init`'d by whichever process created the
            // region, and zeroing them in place would silently turn them
            // back into default (process-private) mutexes.
            unsafe {
                (*ptr).reservation_count = 0;
                (*ptr).reservations = [RawReservation { pid: 0, reserved_mb: 0 }; MAX_RESERVATIONS];
                (*ptr).unused_peaks_mb = 0;
                (*ptr).total_reserved_mb = 0;
                if created {
                    let mut attr: MaybeUninit<libc::pthread_mutexattr_t> = MaybeUninit::uninit();
                    libc::pthread_mutexattr_init(attr.as_mut_ptr());
                    libc::pthread_mutexattr_setpshared(
                        attr.as_mut_ptr(),
                        libc::PTHREAD_PROCESS_SHARED,
                    );
                    libc::pthread_mutex_init(
                        std::ptr::addr_of_mut!((*ptr).reserved_count_mutex),
                        attr.as_ptr(),
                    );
                    libc::pthread_mutex_init(
                        std::ptr::addr_of_mut!((*ptr).total_reserved_mb_mutex),
                        attr.as_ptr(),
                    );
                    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                    debug!("created new shared memory region, zeroed and mutexes initialised");
                } else {
                    debug!("top-level driver zeroed existing shared memory region");
                }
            }
        }

        Ok(SharedRegion { fd, ptr, top_level })
    }

    fn with_count_mutex<T>(&self, f: impl FnOnce(&mut RawSharedMemoryData) -> T) -> T {
        // SAFETY: the mutex is process-shared and correctly initialised by
        // whichever process created the region; `self.ptr` is valid for the
        // lifetime of this handle.
        unsafe {
            libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*self.ptr).reserved_count_mutex));
            let result = f(&mut *self.ptr);
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*self.ptr).reserved_count_mutex));
            result
        }
    }

    fn with_total_mutex<T>(&self, f: impl FnOnce(&mut RawSharedMemoryData) -> T) -> T {
        // SAFETY: see `with_count_mutex`.
        unsafe {
            libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*self.ptr).total_reserved_mb_mutex));
            let result = f(&mut *self.ptr);
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*self.ptr).total_reserved_mb_mutex));
            result
        }
    }

    /// A read-only reference to the mapped region
    ///
    /// Reads of `total_reserved_mb`/`unused_peaks_mb` outside the mutexes
    /// are intentionally lock-free per §4.2's eventual-consistency note.
    fn data(&self) -> &RawSharedMemoryData {
        // SAFETY: `self.ptr` stays valid for the handle's lifetime.
        unsafe { &*self.ptr }
    }

    /// `find_or_create_slot(pid) -> slot index`
    ///
    /// Scans `reservations[0..count]` for `pid`; if absent, claims the
    /// first slot with `pid == 0`, extending `count` if needed. Errors with
    /// [`ErrorKind::SlotExhausted`] when the table is full.
    pub fn find_or_create_slot(&self, pid: Pid) -> Result<usize> {
        let count = self.data().reservation_count as usize;
        for i in 0..count.min(MAX_RESERVATIONS) {
            if self.data().reservations[i].pid == pid {
                return Ok(i);
            }
        }

        self.with_count_mutex(|data| {
            let count = data.reservation_count as usize;
            for i in 0..count.min(MAX_RESERVATIONS) {
                if data.reservations[i].pid == pid {
                    return Ok(i);
                }
            }
            for i in 0..MAX_RESERVATIONS {
                if data.reservations[i].pid == 0 {
                    data.reservations[i].pid = pid;
                    data.reservations[i].reserved_mb = 0;
                    if i >= count {
                        data.reservation_count = (i + 1) as u32;
                    }
                    return Ok(i);
                }
            }
            Err(Error::SlotExhausted {
                capacity: MAX_RESERVATIONS,
            })
        })
    }

    /// Look up an existing slot for `pid` without creating one
    pub fn find_slot(&self, pid: Pid) -> Option<usize> {
        let count = self.data().reservation_count as usize;
        (0..count.min(MAX_RESERVATIONS)).find(|&i| self.data().reservations[i].pid == pid)
    }

    /// Read a slot's current reservation, if occupied
    pub fn reservation_at(&self, slot: usize) -> Reservation {
        let r = self.data().reservations[slot];
        Reservation {
            pid: r.pid,
            reserved_mb: r.reserved_mb,
        }
    }

    /// Set `reservations[slot].reserved_mb = mb`, returning the prior value
    pub fn set_slot_mb(&self, slot: usize, mb: Megabytes) -> Megabytes {
        self.with_count_mutex(|data| {
            let old = data.reservations[slot].reserved_mb;
            data.reservations[slot].reserved_mb = mb;
            old
        })
    }

    /// `free_slot(pid)`: clear `pid`/`reserved_mb` at `slot`
    ///
    /// Does not shrink `reservation_count`; holes are tolerated and may be
    /// reused by a later [`Self::find_or_create_slot`].
    pub fn free_slot(&self, slot: usize) {
        self.with_count_mutex(|data| {
            data.reservations[slot].pid = 0;
            data.reservations[slot].reserved_mb = 0;
        });
    }

    /// `set_total_reserved_delta(old, new)`: adjust the global sum, saturating at zero
    pub fn adjust_total_reserved(&self, old: Megabytes, new: Megabytes) {
        self.with_total_mutex(|data| {
            if new >= old {
                data.total_reserved_mb += new - old;
            } else {
                data.total_reserved_mb = data.total_reserved_mb.saturating_sub(old - new);
            }
        });
    }

    /// Current `total_reserved_mb`, read without locking (best-effort)
    pub fn total_reserved_mb(&self) -> Megabytes {
        self.data().total_reserved_mb
    }

    /// Current `unused_peaks_mb`, read without locking (best-effort)
    pub fn unused_peaks_mb(&self) -> Megabytes {
        self.data().unused_peaks_mb
    }

    /// Overwrite `unused_peaks_mb`, called once per monitor tick
    pub fn set_unused_peaks_mb(&self, value: Megabytes) {
        // SAFETY: single `u64` write; the original treats this field as
        // `volatile` rather than mutex-guarded, and this crate follows suit.
        unsafe {
            (*self.ptr).unused_peaks_mb = value;
        }
    }

    /// Recompute `Σ reserved_mb` over the live table, for the monitor's sanity pass
    pub fn sum_reserved_mb(&self) -> Megabytes {
        self.with_count_mutex(|data| {
            let count = data.reservation_count as usize;
            (0..count.min(MAX_RESERVATIONS))
                .map(|i| data.reservations[i].reserved_mb)
                .sum()
        })
    }

    /// `detach()`: unmap the region
    ///
    /// Sub-builds call this without unlinking; only the top-level driver
    /// additionally calls [`Self::unlink`].
    pub fn detach(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr was obtained from a successful mmap of this size.
            unsafe {
                libc::munmap(
                    self.ptr as *mut libc::c_void,
                    std::mem::size_of::<RawSharedMemoryData>(),
                );
            }
            self.ptr = std::ptr::null_mut();
        }
        if self.fd != -1 {
            // SAFETY: fd was obtained from a successful shm_open/ftruncate.
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }

    /// `unlink()`: remove the shared memory object from the system
    ///
    /// Only the top-level driver should call this, and only after
    /// [`Self::detach`].
    pub fn unlink(&self) {
        if !self.top_level {
            warn!("unlink() called on a non-top-level SharedRegion handle, ignoring");
            return;
        }
        let name = CString::new(SHARED_MEMORY_NAME).expect("no interior NUL");
        // SAFETY: name is a valid NUL-terminated C string.
        if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, "shm_unlink failed");
            }
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.detach();
        if self.top_level {
            self.unlink();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    // These tests share the single system-wide `/make_memory_shared` object,
    // so they run serially and each top-level attach zeroes it fresh.

    #[test]
    #[serial]
    fn attach_or_create_zeroes_for_top_level() {
        let region = SharedRegion::attach_or_create(true).unwrap();
        assert_eq!(region.total_reserved_mb(), 0);
        assert_eq!(region.unused_peaks_mb(), 0);
    }

    #[test]
    #[serial]
    fn find_or_create_slot_reuses_by_pid() {
        let region = SharedRegion::attach_or_create(true).unwrap();
        let slot_a = region.find_or_create_slot(111).unwrap();
        let slot_b = region.find_or_create_slot(111).unwrap();
        assert_eq!(slot_a, slot_b);
    }

    #[test]
    #[serial]
    fn free_slot_allows_reuse() {
        let region = SharedRegion::attach_or_create(true).unwrap();
        let slot = region.find_or_create_slot(222).unwrap();
        region.free_slot(slot);
        assert_eq!(region.reservation_at(slot).pid, 0);
        let reused = region.find_or_create_slot(333).unwrap();
        assert_eq!(reused, slot);
    }

    #[test]
    #[serial]
    fn adjust_total_reserved_saturates_at_zero() {
        let region = SharedRegion::attach_or_create(true).unwrap();
        region.adjust_total_reserved(0, 5);
        assert_eq!(region.total_reserved_mb(), 5);
        region.adjust_total_reserved(5, 0);
        assert_eq!(region.total_reserved_mb(), 0);
        // underflow guard: decreasing further must not wrap
        region.adjust_total_reserved(100, 0);
        assert_eq!(region.total_reserved_mb(), 0);
    }

    #[test]
    #[serial]
    fn slot_exhaustion_is_reported() {
        let region = SharedRegion::attach_or_create(true).unwrap();
        for pid in 1..=MAX_RESERVATIONS as Pid {
            region.find_or_create_slot(pid).unwrap();
        }
        let err = region.find_or_create_slot(MAX_RESERVATIONS as Pid + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotExhausted);
    }
}
