//!
//! WAL file names, as PostgreSQL hands them to `restore_command`.
//!
//! A regular segment name is `TTTTTTTTXXXXXXXXYYYYYYYY`: timeline, "log" and
//! "seg" as upper-case hex. The segment number within the timeline is
//! `log * segments_per_xlog_id + seg`.
//!
use std::fmt;
use std::str::FromStr;

/// Length of a regular WAL segment file name.
pub const XLOG_FNAME_LEN: usize = 24;

/// Length of a timeline id in hex, as found in `.history` file names.
const TIMELINE_FNAME_LEN: usize = 8;

pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const MIN_WAL_SEGMENT_SIZE: u64 = 1024 * 1024;
const MAX_WAL_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

const COMPRESSION_SUFFIXES: &[&str] = &["gz", "bz2", "xz", "lz4", "snappy", "zst"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Regular { timeline: u32, log: u32, seg: u32 },
    Partial,
    History { timeline: u32 },
    Backup,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid WAL file name '{name}': {reason}")]
pub struct InvalidSegmentName {
    name: String,
    reason: &'static str,
}

/// A validated WAL file name. Used verbatim as the spool key and as the
/// argument handed to the fetch tool, so it can never contain a path separator.
#[derive(Debug, Clone)]
pub struct SegmentName {
    name: String,
    kind: SegmentKind,
}

impl PartialEq for SegmentName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SegmentName {}

impl std::hash::Hash for SegmentName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

pub fn is_valid_wal_segment_size(size: u64) -> bool {
    size.is_power_of_two() && (MIN_WAL_SEGMENT_SIZE..=MAX_WAL_SEGMENT_SIZE).contains(&size)
}

fn segments_per_xlog_id(wal_segment_size: u64) -> u64 {
    0x1_0000_0000 / wal_segment_size
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|c| c.is_ascii_hexdigit())
}

fn parse_hex_u32(s: &str) -> u32 {
    // callers only pass 8 validated hex digits
    u32::from_str_radix(s, 16).unwrap_or_default()
}

/// Splits an optional compression suffix off `name`.
fn split_compression(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((base, ext)) if COMPRESSION_SUFFIXES.contains(&ext) => (base, Some(ext)),
        _ => (name, None),
    }
}

fn classify(base: &str) -> Option<SegmentKind> {
    if is_hex(base, XLOG_FNAME_LEN) {
        return Some(SegmentKind::Regular {
            timeline: parse_hex_u32(&base[0..8]),
            log: parse_hex_u32(&base[8..16]),
            seg: parse_hex_u32(&base[16..24]),
        });
    }
    if let Some(prefix) = base.strip_suffix(".partial") {
        return is_hex(prefix, XLOG_FNAME_LEN).then_some(SegmentKind::Partial);
    }
    if let Some(prefix) = base.strip_suffix(".history") {
        return is_hex(prefix, TIMELINE_FNAME_LEN).then(|| SegmentKind::History {
            timeline: parse_hex_u32(prefix),
        });
    }
    if let Some(prefix) = base.strip_suffix(".backup") {
        let (segment, offset) = prefix.split_once('.')?;
        return (is_hex(segment, XLOG_FNAME_LEN) && is_hex(offset, 8))
            .then_some(SegmentKind::Backup);
    }
    None
}

impl SegmentName {
    pub fn parse(name: &str) -> Result<Self, InvalidSegmentName> {
        let invalid = |reason| InvalidSegmentName {
            name: name.to_owned(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if name.contains(['/', '\\']) {
            return Err(invalid("contains a path separator"));
        }
        let (base, _) = split_compression(name);
        let kind = classify(base).ok_or_else(|| {
            invalid("expected a WAL segment, partial segment, history or backup label file name")
        })?;
        Ok(SegmentName {
            name: name.to_owned(),
            kind,
        })
    }

    /// Name of the regular segment `segno` of `timeline`. `wal_segment_size` must be valid.
    fn from_segno(timeline: u32, segno: u64, wal_segment_size: u64) -> Self {
        let per_id = segments_per_xlog_id(wal_segment_size);
        let (log, seg) = (segno / per_id, segno % per_id);
        SegmentName {
            name: format!("{timeline:08X}{log:08X}{seg:08X}"),
            kind: SegmentKind::Regular {
                timeline,
                log: log as u32,
                seg: seg as u32,
            },
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn compression(&self) -> Option<&str> {
        split_compression(&self.name).1
    }

    /// Returns the `count` segments following this one on the same timeline,
    /// in archival order.
    ///
    /// Only uncompressed regular segments have successors: partial segments,
    /// history and backup label files yield an empty list, and so does a
    /// segment size rejected by [`is_valid_wal_segment_size`]. The list stops
    /// early at the end of the addressable WAL.
    pub fn next_segments(&self, count: usize, wal_segment_size: u64) -> Vec<SegmentName> {
        let SegmentKind::Regular { timeline, log, seg } = self.kind() else {
            return Vec::new();
        };
        if self.compression().is_some() || !is_valid_wal_segment_size(wal_segment_size) {
            return Vec::new();
        }

        let per_id = segments_per_xlog_id(wal_segment_size);
        let last_segno = (u64::from(u32::MAX) + 1) * per_id - 1;
        let segno = u64::from(log) * per_id + u64::from(seg);

        (1..=count as u64)
            .map_while(|i| segno.checked_add(i).filter(|n| *n <= last_segno))
            .map(|n| SegmentName::from_segno(timeline, n, wal_segment_size))
            .collect()
    }
}

impl FromStr for SegmentName {
    type Err = InvalidSegmentName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SegmentName::parse(s)
    }
}

impl TryFrom<String> for SegmentName {
    type Error = InvalidSegmentName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        SegmentName::parse(&s)
    }
}

impl AsRef<str> for SegmentName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[SegmentName]) -> Vec<&str> {
        list.iter().map(SegmentName::as_str).collect()
    }

    #[test]
    fn accepts_postgres_file_names() {
        for name in [
            "00000001000000000000004A",
            "00000001000000000000004a",
            "00000001000000000000004A.partial",
            "00000002.history",
            "000000010000000000000002.00000028.backup",
            "00000001000000000000004A.gz",
            "00000002.history.zst",
        ] {
            let parsed: SegmentName = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn rejects_garbage() {
        for name in [
            "",
            "0000000100000000000000",
            "00000001000000000000004G",
            "00000001000000000000004A.tar",
            "../00000001000000000000004A",
            "00000001000000000000004A/x",
            "0000002.history",
            "000000010000000000000002.backup",
            "00000001000000000000004A.___temp",
            "00000001000000000000004A.gz.gz",
        ] {
            let err = SegmentName::parse(name).unwrap_err();
            assert!(err.to_string().contains("invalid WAL file name"), "{err}");
        }
    }

    #[test]
    fn kinds() {
        let seg = SegmentName::parse("00000003000000A10000004A").unwrap();
        assert_eq!(
            seg.kind(),
            SegmentKind::Regular {
                timeline: 3,
                log: 0xA1,
                seg: 0x4A
            }
        );
        assert_eq!(seg.compression(), None);

        let seg = SegmentName::parse("00000003000000A10000004A.lz4").unwrap();
        assert!(matches!(seg.kind(), SegmentKind::Regular { .. }));
        assert_eq!(seg.compression(), Some("lz4"));

        assert_eq!(
            SegmentName::parse("0000000A.history").unwrap().kind(),
            SegmentKind::History { timeline: 10 }
        );
        assert_eq!(
            SegmentName::parse("00000001000000000000004A.partial")
                .unwrap()
                .kind(),
            SegmentKind::Partial
        );
        assert_eq!(
            SegmentName::parse("000000010000000000000002.00000028.backup")
                .unwrap()
                .kind(),
            SegmentKind::Backup
        );
    }

    #[test]
    fn next_segments_in_archival_order() {
        let seg = SegmentName::parse("00000001000000000000004A").unwrap();
        assert_eq!(
            names(&seg.next_segments(2, DEFAULT_WAL_SEGMENT_SIZE)),
            ["00000001000000000000004B", "00000001000000000000004C"]
        );
        assert!(seg.next_segments(0, DEFAULT_WAL_SEGMENT_SIZE).is_empty());
    }

    #[test]
    fn next_segments_wrap_into_next_log() {
        // 16MiB segments: 256 per log file
        let seg = SegmentName::parse("0000000100000005000000FE").unwrap();
        assert_eq!(
            names(&seg.next_segments(3, DEFAULT_WAL_SEGMENT_SIZE)),
            [
                "0000000100000005000000FF",
                "000000010000000600000000",
                "000000010000000600000001"
            ]
        );

        // 1GiB segments: 4 per log file
        let seg = SegmentName::parse("000000020000000000000003").unwrap();
        assert_eq!(
            names(&seg.next_segments(1, 1024 * 1024 * 1024)),
            ["000000020000000100000000"]
        );
    }

    #[test]
    fn next_segments_stop_at_end_of_wal() {
        let seg = SegmentName::parse("00000001FFFFFFFF000000FE").unwrap();
        assert_eq!(
            names(&seg.next_segments(5, DEFAULT_WAL_SEGMENT_SIZE)),
            ["00000001FFFFFFFF000000FF"]
        );
    }

    #[test]
    fn only_plain_segments_have_successors() {
        for name in [
            "00000001000000000000004A.partial",
            "00000002.history",
            "000000010000000000000002.00000028.backup",
            "00000001000000000000004A.gz",
        ] {
            let seg = SegmentName::parse(name).unwrap();
            assert!(seg.next_segments(4, DEFAULT_WAL_SEGMENT_SIZE).is_empty());
        }
    }

    #[test]
    fn no_successors_for_invalid_segment_size() {
        let seg = SegmentName::parse("00000001000000000000004A").unwrap();
        for size in [0, 3 * 1024 * 1024, 8 * 1024 * 1024 * 1024] {
            assert!(seg.next_segments(1, size).is_empty(), "size {size}");
        }
    }

    #[test]
    fn wal_segment_sizes() {
        assert!(is_valid_wal_segment_size(DEFAULT_WAL_SEGMENT_SIZE));
        assert!(is_valid_wal_segment_size(1024 * 1024));
        assert!(is_valid_wal_segment_size(1024 * 1024 * 1024));
        assert!(!is_valid_wal_segment_size(0));
        assert!(!is_valid_wal_segment_size(512 * 1024));
        assert!(!is_valid_wal_segment_size(3 * 1024 * 1024));
        assert!(!is_valid_wal_segment_size(2 * 1024 * 1024 * 1024));
    }
}
