//! CmdlineExtractor: derive a canonical source-file key from a cmdline (§4.3)
//!
//! Given a space-joined command line (read from `/proc/<pid>/cmdline` with
//! NULs substituted for spaces, or synthesised from an argv array), returns
//! the canonical key under which to profile the job.
#![forbid(unsafe_code)]

use crate::debug::Level;
use crate::internal_prelude::*;

/// Extensions recognised as a compiled translation unit, longest first
const EXTENSIONS: &[&str] = &[".cpp", ".cc", ".c"];

/// Derives canonical profiling keys from process command lines
///
/// Stateless; a unit struct purely to namespace the extraction algorithm
/// the way the original keeps `extract_filename_from_cmdline` /
/// `extract_filename_from_argv` as free functions sharing one core.
pub struct CmdlineExtractor;

impl CmdlineExtractor {
    /// Build the space-joined form of `/proc/<pid>/cmdline`'s raw bytes
    ///
    /// The kernel NUL-separates arguments; this substitutes spaces the way
    /// the original does before running the extraction algorithm on it.
    pub fn cmdline_from_raw(raw: &[u8]) -> String {
        let trimmed = match raw.iter().rposition(|&b| b != 0) {
            Some(last) => &raw[..=last],
            None => return String::new(),
        };
        trimmed
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect::<Vec<u8>>()
            .iter()
            .map(|&b| b as char)
            .collect()
    }

    /// Synthesise a space-joined cmdline from an argv array
    pub fn cmdline_from_argv(argv: &[String]) -> String {
        argv.join(" ")
    }

    /// Extract the canonical key from an already space-joined command line
    ///
    /// Algorithm (§4.3):
    /// 1. Scan left-to-right for every token ending in `.cpp`, `.cc`, or
    ///    `.c` (`.c` only when immediately followed by space or end-of-string).
    /// 2. Backtrack from each candidate's end to the nearest space or `"` —
    ///    that's the token's start.
    /// 3. Accept only tokens containing at least one `/`.
    /// 4. Keep the last accepted candidate.
    /// 5. Strip every leading `../`.
    pub fn extract(text: &str) -> Option<String> {
        let bytes = text.as_bytes();
        let mut best_end: Option<usize> = None;

        let mut i = 0;
        while i < bytes.len() {
            let candidate_end = EXTENSIONS.iter().find_map(|ext| {
                let ext_bytes = ext.as_bytes();
                if bytes[i..].starts_with(ext_bytes) {
                    let end = i + ext_bytes.len();
                    if *ext == ".c" {
                        // only a genuine `.c` boundary, not `.cc`/`.cpp`/`.config`
                        let at_boundary = end == bytes.len() || bytes[end] == b' ';
                        at_boundary.then_some(end)
                    } else {
                        Some(end)
                    }
                } else {
                    None
                }
            });

            if let Some(end) = candidate_end {
                let mut start = i;
                while start > 0 && bytes[start - 1] != b' ' {
                    start -= 1;
                }
                if bytes[start..end].contains(&b'/') {
                    best_end = Some(end);
                }
            }

            i += 1;
        }

        let end = best_end?;
        let mut start = end;
        while start > 0 && !(bytes[start - 1] == b' ' || bytes[start - 1] == b'"') {
            start -= 1;
        }

        let token = &text[start..end];
        Some(Self::strip_leading_parent_dirs(token).to_string())
    }

    fn strip_leading_parent_dirs(mut token: &str) -> &str {
        while let Some(rest) = token.strip_prefix("../") {
            token = rest;
        }
        token
    }

    /// A truncated printable copy of `text` for diagnostics: `len <= max`,
    /// with a trailing `"..."` when truncated. `max == 0` means no limit.
    pub fn truncated_cmdline(text: &str, max: usize) -> String {
        if max == 0 || text.chars().count() <= max {
            return text.to_string();
        }
        let keep = max.saturating_sub(3);
        let truncated: String = text.chars().take(keep).collect();
        format!("{truncated}...")
    }

    /// Diagnostic dump mirroring the original's
    /// `/tmp/make_<prefix>_<HHMMSSmmm>.<caller>.txt` temp files
    ///
    /// Gated behind [`Level::Verbose`] — off by default, opt-in diagnostics
    /// only, never on the hot path.
    pub fn dump_debug_file(
        level: Level,
        ring: &crate::debug::Ring,
        found: Option<&str>,
        pid: Pid,
        parent_pid: Pid,
        depth: u32,
        cmdline: &str,
    ) {
        if !level.admits(Level::Verbose) {
            return;
        }
        let mut message = String::new();
        if let Some(found) = found {
            message.push_str(&format!("FOUND: {found}\n"));
        }
        if pid != 0 {
            message.push_str(&format!("PID={pid} PPID={parent_pid} (d:{depth})\n"));
        }
        message.push_str(cmdline);
        ring.push(Level::Verbose, message);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn picks_last_slash_bearing_c_family_token() {
        let line = "ccache g++ -O2 -Isrc -o build/foo.o src/foo.cpp";
        assert_eq!(
            CmdlineExtractor::extract(line),
            Some("src/foo.cpp".to_string())
        );
    }

    #[test]
    fn rejects_bare_letter_without_slash() {
        // "c" alone is not a path; no candidate has a "/" so nothing matches
        let line = "gcc -x c -o a.out";
        assert_eq!(CmdlineExtractor::extract(line), None);
    }

    #[test]
    fn dot_c_requires_trailing_space_or_eof() {
        assert_eq!(
            CmdlineExtractor::extract("gcc -o out src/a.c"),
            Some("src/a.c".to_string())
        );
        // ".config" must not match as ".c"
        assert_eq!(CmdlineExtractor::extract("cp src/a.config /tmp"), None);
    }

    #[test]
    fn backtracks_to_quote_boundary() {
        // step 2's final backtrack stops at `"` as well as space, so a
        // quoted path glued to a flag (no separating space) is still found
        let line = "gcc -DFOO=\"src/weird.cpp\" -c";
        let result = CmdlineExtractor::extract(line);
        assert_eq!(result.as_deref(), Some("src/weird.cpp"));
    }

    #[test]
    fn strips_leading_parent_dirs() {
        let line = "g++ -o out ../../src/foo.cc";
        assert_eq!(
            CmdlineExtractor::extract(line),
            Some("src/foo.cc".to_string())
        );
    }

    #[test]
    fn cmdline_from_raw_substitutes_nuls_and_trims_trailing() {
        let raw = b"gcc\0-o\0a.out\0src/a.c\0";
        assert_eq!(
            CmdlineExtractor::cmdline_from_raw(raw),
            "gcc -o a.out src/a.c"
        );
    }

    #[test]
    fn truncated_cmdline_adds_ellipsis() {
        let long = "a".repeat(20);
        let short = CmdlineExtractor::truncated_cmdline(&long, 10);
        assert_eq!(short.chars().count(), 10);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn truncated_cmdline_zero_means_unlimited() {
        let long = "a".repeat(20);
        assert_eq!(CmdlineExtractor::truncated_cmdline(&long, 0), long);
    }
}
