//! # Memory Scanning
//!
//! Byte-pattern search across every readable region of a task, plus helpers
//! for rendering target bytes.

use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::error::{MdbError, MdbResult};
use crate::kernel::Protection;
use crate::region::MemoryRange;
use crate::task::Task;

/// One occurrence of a pattern in target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit
{
    /// Address of the first matching byte
    pub address: u64,
    /// Start of the region the match was found in
    pub region: u64,
    /// Bytes around the match, rendered with [`printable`]
    pub context: String,
}

/// Offsets of every (possibly overlapping) occurrence of `needle`.
///
/// ```rust
/// use mdb_core::scan::find_all;
///
/// assert_eq!(find_all(b"aaaa", b"aa").collect::<Vec<_>>(), [0, 1, 2]);
/// ```
pub fn find_all<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a
{
    let windows = if needle.is_empty() { None } else { Some(haystack.windows(needle.len())) };
    windows
        .into_iter()
        .flatten()
        .enumerate()
        .filter(move |(_, window)| *window == needle)
        .map(|(offset, _)| offset)
}

/// Printable ASCII kept as is, everything else as `.`.
#[must_use]
pub fn printable(bytes: &[u8]) -> String
{
    bytes
        .iter()
        .map(|&byte| if (32..127).contains(&byte) { byte as char } else { '.' })
        .collect()
}

/// Search every readable region of `task` for `pattern`.
///
/// Each hit carries up to `context` bytes on either side of the match.
/// Regions that fail to read are logged and skipped.
///
/// ## Errors
///
/// - `InvalidArgument`: empty pattern
/// - `NotAttached`
/// - `Kernel`: region enumeration failed
pub fn search(task: &Task, pattern: &[u8], context: usize) -> MdbResult<Vec<SearchHit>>
{
    if pattern.is_empty() {
        return Err(MdbError::InvalidArgument("search pattern is empty".to_string()));
    }

    let mut hits = Vec::new();
    for (index, region) in task.regions().enumerate() {
        let region = region?;
        if !region.protection().contains(Protection::READ) {
            continue;
        }
        debug!(index, address = region.address(), size = region.size(), "Scanning region");

        let data = match region.read_all() {
            Ok(data) => data,
            Err(MdbError::Kernel(err)) => {
                warn!(address = region.address(), "Skipping unreadable region: {err}");
                continue;
            }
            Err(err) => return Err(err),
        };

        for offset in find_all(&data, pattern) {
            let start = offset.saturating_sub(context);
            let end = (offset + pattern.len() + context).min(data.len());
            hits.push(SearchHit {
                address: region.address() + offset as u64,
                region: region.address(),
                context: printable(&data[start..end]),
            });
        }
    }
    Ok(hits)
}

/// Hex plus ASCII view of `bytes`, `width` bytes per line (8 to 32).
#[must_use]
pub fn format_hexdump(base: u64, bytes: &[u8], width: usize) -> String
{
    let width = width.clamp(8, 32);
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(width).enumerate() {
        let address = base.saturating_add((line * width) as u64);
        let _ = write!(out, "{address:016x}: ");
        for column in 0..width {
            match chunk.get(column) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.push_str(&printable(chunk));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn find_all_handles_edges()
    {
        assert_eq!(find_all(b"abcabc", b"abc").collect::<Vec<_>>(), [0, 3]);
        assert_eq!(find_all(b"ab", b"abc").count(), 0);
        assert_eq!(find_all(b"abc", b"").count(), 0);
    }

    #[test]
    fn printable_masks_control_and_high_bytes()
    {
        assert_eq!(printable(b"hi\n\x7f\x80 ~"), "hi... ~");
    }

    #[test]
    fn hexdump_pads_short_lines()
    {
        let dump = format_hexdump(0x1000, b"ABCDEFGHIJ", 8);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0000000000001000: 41 42 43 44 45 46 47 48  ABCDEFGH");
        assert!(lines[1].starts_with("0000000000001008: 49 4a "));
        assert!(lines[1].ends_with(" IJ"));
    }
}
