//! MemoryMonitor: the dedicated sampling + rendering thread (§4.5)
//!
//! Started only by the top-level driver, iff memory awareness is enabled.
//! This thread is the crate's single writer of [`ProfileStore`] and
//! [`DescendantTracker`]; everything else only reads profiles or calls
//! [`crate::reservation::ReservationController`].

use crate::descendants::{DescendantTracker, ProcSource, RealProcSource};
use crate::internal_prelude::*;
use crate::profile::ProfileStore;
use crate::shared_region::SharedRegion;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::mpsc;

/// Status-line redraw rate limit (one redraw per period, §4.5)
const REDRAW_INTERVAL: Duration = Duration::from_millis(300);
/// Tick period between `/proc` samples
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum interval between [`ProfileStore::save`] calls once dirty
const SAVE_INTERVAL: Duration = Duration::from_secs(10);
/// Width of the coloured memory bar, in characters
const BAR_WIDTH: usize = 20;
/// Ten-frame braille spinner, advanced once per redraw
const SPINNER_FRAMES: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

const ANSI_PURPLE: &str = "\x1b[1;35m";
const ANSI_GREEN: &str = "\x1b[1;32m";
const ANSI_YELLOW: &str = "\x1b[1;33m";
const ANSI_GRAY: &str = "\x1b[0;90m";
const ANSI_WHITE: &str = "\x1b[1;37m";
const ANSI_RESET: &str = "\x1b[0m";

/// Reset sequence written on teardown / broken pipe: CR, clear-to-EOL, LF
const TERMINAL_RESET_SEQUENCE: &str = "\r\x1b[K\n";

/// System-wide memory snapshot, from `/proc/meminfo`
#[derive(Debug, Clone, Copy)]
pub struct SystemMemory {
    /// total installed memory, MiB
    pub total_mb: Megabytes,
    /// available memory, MiB
    pub available_mb: Megabytes,
}

impl SystemMemory {
    /// Percentage of total memory currently in use, 0..=100
    pub fn used_percent(&self) -> u32 {
        if self.total_mb == 0 {
            return 0;
        }
        (((self.total_mb.saturating_sub(self.available_mb)) * 100) / self.total_mb) as u32
    }
}

/// Reads total/available system memory, abstracted for testability
pub trait MemorySource {
    /// Sample current system memory, or `None` if unreadable
    fn read(&self) -> Option<SystemMemory>;
}

/// [`MemorySource`] backed by the `sysinfo` crate
pub struct SysinfoMemorySource {
    system: Mutex<sysinfo::System>,
}

impl Default for SysinfoMemorySource {
    fn default() -> Self {
        SysinfoMemorySource {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl MemorySource for SysinfoMemorySource {
    fn read(&self) -> Option<SystemMemory> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total_mb = system.total_memory() / (1024 * 1024);
        let available_mb = system.available_memory() / (1024 * 1024);
        if total_mb == 0 {
            return None;
        }
        Some(SystemMemory {
            total_mb,
            available_mb,
        })
    }
}

/// Render the four-segment coloured bar described in §11
///
/// `make_mb`/`imminent_mb` are proportions of `total_mb`; `used_percent` is
/// the overall system usage used to size the "other" segment.
pub fn render_bar(total_mb: Megabytes, make_mb: Megabytes, imminent_mb: Megabytes, used_percent: u32) -> String {
    if total_mb == 0 {
        return String::new();
    }
    let bar_len = BAR_WIDTH as u64;
    let make_filled = (make_mb * bar_len) / total_mb;
    let imminent_filled = (imminent_mb * bar_len) / total_mb;
    let total_used_filled = (used_percent as u64 * bar_len) / 100;
    let other_filled = total_used_filled.saturating_sub(make_filled);
    let free_filled = bar_len
        .saturating_sub(make_filled)
        .saturating_sub(other_filled)
        .saturating_sub(imminent_filled);

    let mut bar = String::new();
    if make_filled > 0 {
        bar.push_str(ANSI_PURPLE);
        bar.push_str(&"█".repeat(make_filled as usize));
    }
    if other_filled > 0 {
        bar.push_str(ANSI_GREEN);
        bar.push_str(&"█".repeat(other_filled as usize));
    }
    if imminent_filled > 0 {
        bar.push_str(ANSI_YELLOW);
        bar.push_str(&"░".repeat(imminent_filled as usize));
    }
    if free_filled > 0 {
        bar.push_str(ANSI_GRAY);
        bar.push_str(&"░".repeat(free_filled as usize));
    }
    bar.push_str(ANSI_RESET);
    bar
}

/// Format one status line (without cursor positioning)
pub fn render_status(
    spinner: char,
    bar: &str,
    used_percent: u32,
    available_mb: Megabytes,
    total_jobs: u32,
) -> String {
    format!(
        "{spinner}{bar} {ANSI_WHITE}{used_percent}%{ANSI_RESET} {ANSI_GRAY}({available_mb}MB){ANSI_RESET} {ANSI_GRAY}{total_jobs} jobs{ANSI_RESET}"
    )
}

/// Wrap `status` in the cursor save/restore sequence, or a plain line
///
/// Only uses cursor tricks when both stderr and stdout are TTYs; otherwise
/// emits a plain newline-terminated line so piped output isn't corrupted.
pub fn position_status(status: &str, term_width: u32, both_ttys: bool) -> String {
    if !both_ttys {
        return format!("{status}\n");
    }
    let visible_len = 50u32;
    let col = term_width.saturating_sub(visible_len).max(1);
    format!("\x1b[A\x1b[s\x1b[{col}G{status}\x1b[u\x1b[B")
}

/// A synchronous handle to the running monitor thread
pub struct MonitorHandle {
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the thread to stop and join it (stop latency <= ~100ms)
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Signal-context stop: clear the flag without joining
    ///
    /// For use from a signal handler or other context where blocking on
    /// `join` isn't acceptable; the thread observes `running` at the top of
    /// its next tick and exits on its own.
    pub fn request_stop_nonblocking(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Write the terminal reset sequence to `fd`, ignoring write errors
pub fn reset_terminal(fd: RawFd) {
    use std::io::Write;
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let _ = file.write_all(TERMINAL_RESET_SEQUENCE.as_bytes());
    std::mem::forget(file); // don't close someone else's fd
}

/// Owns the per-tick sampling/rendering loop; spawned once by the top-level driver
pub struct MemoryMonitor {
    config: Config,
    memory_source: Box<dyn MemorySource + Send>,
    proc_source: Box<dyn ProcSource + Send>,
    shared_region: Arc<SharedRegion>,
    profiles: Mutex<ProfileStore>,
}

impl MemoryMonitor {
    /// Construct a monitor using the real `/proc` and `sysinfo` sources
    pub fn new(config: Config, shared_region: Arc<SharedRegion>) -> Self {
        let (profiles, err) = ProfileStore::load(config.cache_path());
        if let Some(err) = err {
            debug!(%err, "starting with an empty memory profile cache");
        }
        MemoryMonitor {
            config,
            memory_source: Box::new(SysinfoMemorySource::default()),
            proc_source: Box::new(RealProcSource),
            shared_region,
            profiles: Mutex::new(profiles),
        }
    }

    /// Spawn the monitor thread
    ///
    /// Returns `None` (and disables the display) if the terminal width
    /// cannot be determined, matching §4.5's "unobtainable => disable
    /// display" rule; the thread still runs for profiling/reservation
    /// bookkeeping in that case.
    pub fn spawn(self: Arc<Self>, driver_pid: Pid) -> MonitorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel();
        let running_thread = running.clone();

        let term_width = cached_terminal_width();
        let display_enabled = self.config.enabled()
            && !self.config.display_disabled()
            && term_width.is_some();

        let monitor_stderr_fd = unsafe { libc::dup(libc::STDERR_FILENO) };

        let join = std::thread::Builder::new()
            .name("buildmem-monitor".into())
            .spawn(move || {
                self.run_loop(
                    driver_pid,
                    running_thread,
                    stop_rx,
                    term_width.unwrap_or(80),
                    display_enabled,
                    monitor_stderr_fd,
                );
            })
            .expect("failed to spawn memory monitor thread");

        MonitorHandle {
            running,
            stop_tx,
            join: Some(join),
        }
    }

    fn run_loop(
        &self,
        driver_pid: Pid,
        running: Arc<AtomicBool>,
        stop_rx: mpsc::Receiver<()>,
        term_width: u32,
        display_enabled: bool,
        stderr_fd: RawFd,
    ) {
        let mut spinner_idx = 0usize;
        let mut last_redraw = Instant::now() - REDRAW_INTERVAL;
        let mut last_save = Instant::now() - SAVE_INTERVAL;
        let mut tracker = DescendantTracker::new();
        let both_ttys = atty::is(atty::Stream::Stderr) && atty::is(atty::Stream::Stdout);

        while running.load(Ordering::SeqCst) {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            std::thread::sleep(TICK_INTERVAL);
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let Some(mem) = self.memory_source.read() else {
                error!("could not determine system memory usage, stopping monitor");
                return;
            };

            let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);

            let scan = match tracker.scan(self.proc_source.as_ref(), &mut profiles, driver_pid, |pid| {
                if let Some(slot) = self.shared_region.find_slot(pid) {
                    let old = self.shared_region.reservation_at(slot).reserved_mb;
                    self.shared_region.set_slot_mb(slot, 0);
                    self.shared_region.free_slot(slot);
                    self.shared_region.adjust_total_reserved(old, 0);
                }
            }) {
                Ok(scan) => scan,
                Err(err) => {
                    error!(%err, "failed to scan /proc, stopping monitor");
                    return;
                }
            };

            tracker.sweep_exited(self.proc_source.as_ref(), &mut profiles);

            self.shared_region.set_unused_peaks_mb(scan.unused_peaks_mb);
            let observed_total = self.shared_region.sum_reserved_mb();
            let published_total = self.shared_region.total_reserved_mb();
            if observed_total != published_total {
                let err = Error::internal(format!(
                    "reservation total drifted: observed {observed_total} != published {published_total}"
                ));
                warn!(%err, "self-correcting published reservation total");
                self.shared_region.adjust_total_reserved(published_total, observed_total);
            }

            if profiles.is_dirty() && last_save.elapsed() >= SAVE_INTERVAL {
                if let Err(err) = profiles.save() {
                    warn!(%err, "failed to save memory profile cache");
                }
                last_save = Instant::now();
            }
            drop(profiles);

            if !display_enabled {
                continue;
            }
            if last_redraw.elapsed() < REDRAW_INTERVAL {
                continue;
            }
            last_redraw = Instant::now();

            let spinner = SPINNER_FRAMES[spinner_idx % SPINNER_FRAMES.len()];
            spinner_idx += 1;

            let total_make_mem = scan.total_rss_kib / 1024;
            let imminent_mb = self.shared_region.total_reserved_mb() + self.shared_region.unused_peaks_mb();
            let bar = render_bar(mem.total_mb, total_make_mem, imminent_mb, mem.used_percent());
            let status = render_status(spinner, &bar, mem.used_percent(), mem.available_mb, scan.total_jobs);
            let line = position_status(&status, term_width, both_ttys);

            if !write_line(stderr_fd, &line) {
                warn!("monitor status write failed (broken pipe), resetting terminal and stopping");
                reset_terminal(stderr_fd);
                running.store(false, Ordering::SeqCst);
                return;
            }
        }

        if stderr_fd >= 0 {
            unsafe {
                libc::close(stderr_fd);
            }
        }
    }
}

fn write_line(fd: RawFd, line: &str) -> bool {
    let bytes = line.as_bytes();
    // SAFETY: fd is either STDERR_FILENO or a valid dup() of it.
    let written = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    written >= 0
}

/// Cache the terminal width once, the way the original caches it before the
/// monitor thread starts (an ioctl from a background thread can block).
fn cached_terminal_width() -> Option<u32> {
    if !atty::is(atty::Stream::Stderr) {
        return None;
    }
    // SAFETY: winsize is a plain POD struct; ioctl fills it or returns -1.
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDERR_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
            Some(ws.ws_col as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_bar_is_empty_for_zero_total() {
        assert_eq!(render_bar(0, 10, 0, 50), "");
    }

    #[test]
    fn render_bar_proportions_segments() {
        let bar = render_bar(1000, 500, 0, 60);
        // make_filled = 500*20/1000 = 10 purple blocks
        assert_eq!(bar.matches('█').count() >= 10, true);
        assert!(bar.contains(ANSI_PURPLE));
        assert!(bar.ends_with(ANSI_RESET));
    }

    #[test]
    fn position_status_plain_when_not_both_ttys() {
        let out = position_status("hello", 80, false);
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn position_status_uses_cursor_sequence_when_both_ttys() {
        let out = position_status("hello", 80, true);
        assert!(out.starts_with("\x1b[A\x1b[s\x1b["));
        assert!(out.ends_with("\x1b[u\x1b[B"));
    }

    #[test]
    fn position_status_clamps_column_to_at_least_one() {
        let out = position_status("hello", 10, true);
        assert!(out.contains("\x1b[1G"));
    }

    #[test]
    fn used_percent_handles_zero_total() {
        let mem = SystemMemory {
            total_mb: 0,
            available_mb: 0,
        };
        assert_eq!(mem.used_percent(), 0);
    }

    struct FixedMemorySource(SystemMemory);
    impl MemorySource for FixedMemorySource {
        fn read(&self) -> Option<SystemMemory> {
            Some(self.0)
        }
    }

    #[test]
    fn fixed_memory_source_round_trips() {
        let source = FixedMemorySource(SystemMemory {
            total_mb: 8000,
            available_mb: 4000,
        });
        let mem = source.read().unwrap();
        assert_eq!(mem.used_percent(), 50);
    }
}
