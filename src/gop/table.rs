use crate::media::{DecodeRange, Micros};

/// One independently decodable chunk of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopSpan {
    pub index: usize,
    /// Decode-order number of the sample that opens the GOP.
    pub sequence_number: usize,
    pub timestamp: Micros,
    pub duration: Micros,
    /// Largest presentation end of any sample the GOP owns.
    pub decode_end: Micros,
    pub byte_start: u64,
    pub byte_end: u64,
    pub video_packets: usize,
    pub audio_packets: usize,
}

impl GopSpan {
    pub fn end(&self) -> Micros {
        self.timestamp + self.duration
    }

    pub fn contains(&self, time: Micros) -> bool {
        time >= self.timestamp && time < self.end()
    }

    pub fn decode_range(&self) -> DecodeRange {
        DecodeRange {
            start: self.timestamp,
            end: self.decode_end.max(self.end()),
            byte_start: self.byte_start,
            byte_end: self.byte_end,
        }
    }
}

/// GOPs sorted by timestamp with contiguous indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GopTable {
    entries: Vec<GopSpan>,
    duration: Micros,
}

impl GopTable {
    pub fn new(entries: Vec<GopSpan>, duration: Micros) -> Self {
        Self { entries, duration }
    }

    pub fn entries(&self) -> &[GopSpan] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&GopSpan> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duration(&self) -> Micros {
        self.duration
    }

    /// Index of the last GOP starting at or before `time`. `None` when
    /// `time` lies outside `[-tolerance, duration + tolerance]`.
    pub fn resolve(&self, time: Micros, tolerance: Micros) -> Option<usize> {
        if self.entries.is_empty() || time < -tolerance || time > self.duration + tolerance {
            return None;
        }
        if self.entries.len() == 1 {
            return Some(0);
        }
        let after = self.entries.partition_point(|e| e.timestamp <= time);
        Some(after.saturating_sub(1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn uniform_table(count: usize, gop_us: Micros) -> GopTable {
        let entries = (0..count)
            .map(|i| GopSpan {
                index: i,
                sequence_number: i * 25,
                timestamp: i as Micros * gop_us,
                duration: gop_us,
                decode_end: (i as Micros + 1) * gop_us,
                byte_start: i as u64 * 1000,
                byte_end: (i as u64 + 1) * 1000,
                video_packets: 25,
                audio_packets: 0,
            })
            .collect();
        GopTable::new(entries, count as Micros * gop_us)
    }

    #[test]
    fn test_resolve_matches_linear_scan() {
        let table = uniform_table(10, 1_000_000);
        for time in (-500_000..10_500_000).step_by(37_000) {
            let expected = table
                .entries()
                .iter()
                .rposition(|e| e.timestamp <= time)
                .unwrap_or(0);
            assert_eq!(table.resolve(time, 1_000_000), Some(expected), "time {time}");
        }
    }

    #[test]
    fn test_resolve_boundaries() {
        let table = uniform_table(10, 1_000_000);
        assert_eq!(table.resolve(1_000_000, 0), Some(1));
        assert_eq!(table.resolve(999_999, 0), Some(0));
        assert_eq!(table.resolve(-1, 0), None);
        assert_eq!(table.resolve(-200_000, 250_000), Some(0));
        assert_eq!(table.resolve(10_250_000, 250_000), Some(9));
        assert_eq!(table.resolve(10_250_001, 250_000), None);
    }

    #[test]
    fn test_single_entry_and_empty() {
        let table = uniform_table(1, 5_000_000);
        assert_eq!(table.resolve(4_000_000, 0), Some(0));
        assert_eq!(table.resolve(-100, 100), Some(0));
        assert_eq!(GopTable::default().resolve(0, 1_000), None);
    }

    #[test]
    fn test_decode_range_covers_reference_window() {
        let mut span = uniform_table(2, 1_000_000).entries()[1];
        span.decode_end = 2_200_000;
        let range = span.decode_range();
        assert_eq!(range.start, 1_000_000);
        assert_eq!(range.end, 2_200_000);
        assert_eq!((range.byte_start, range.byte_end), (1000, 2000));
        assert!(span.contains(1_999_999));
        assert!(!span.contains(2_000_000));
    }
}
