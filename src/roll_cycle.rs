use std::fmt;

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::{Error, Result};

pub const SEGMENT_SUFFIX: &str = ".cq4";

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// How a cycle's UTC start time is rendered into a segment file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileNameFormat {
    /// `yyyyMMdd`
    Daily,
    /// `yyyyMMdd-HH`
    Hourly,
    /// `yyyyMMdd-HHmm`
    Minutely,
    /// `yyyyMMdd-HHmmss`
    Secondly,
}

impl FileNameFormat {
    fn render(self, at: OffsetDateTime) -> String {
        let date = format!("{:04}{:02}{:02}", at.year(), u8::from(at.month()), at.day());
        match self {
            FileNameFormat::Daily => date,
            FileNameFormat::Hourly => format!("{date}-{:02}", at.hour()),
            FileNameFormat::Minutely => format!("{date}-{:02}{:02}", at.hour(), at.minute()),
            FileNameFormat::Secondly => format!(
                "{date}-{:02}{:02}{:02}",
                at.hour(),
                at.minute(),
                at.second()
            ),
        }
    }

    fn time_digits(self) -> usize {
        match self {
            FileNameFormat::Daily => 0,
            FileNameFormat::Hourly => 2,
            FileNameFormat::Minutely => 4,
            FileNameFormat::Secondly => 6,
        }
    }

    /// Parses a rendered stem back into milliseconds since the UNIX epoch.
    fn parse_ms(self, stem: &str) -> Option<i64> {
        let (date, time) = match self.time_digits() {
            0 => (stem, ""),
            _ => stem.split_once('-')?,
        };
        if date.len() != 8 || time.len() != self.time_digits() {
            return None;
        }
        if !date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let field = |s: &str, from: usize, to: usize| -> Option<u8> {
            s.get(from..to).and_then(|digits| digits.parse().ok())
        };
        let year: i32 = date.get(0..4)?.parse().ok()?;
        let month = Month::try_from(field(date, 4, 6)?).ok()?;
        let day = field(date, 6, 8)?;
        let hour = if time.len() >= 2 { field(time, 0, 2)? } else { 0 };
        let minute = if time.len() >= 4 { field(time, 2, 4)? } else { 0 };
        let second = if time.len() >= 6 { field(time, 4, 6)? } else { 0 };
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms(hour, minute, second).ok()?;
        let at = PrimitiveDateTime::new(date, time).assume_utc();
        Some(at.unix_timestamp() * 1000)
    }
}

/// Definition of how time is cut into cycles and how indices are laid out within them.
///
/// An index is `(cycle << cycle_shift) | sequence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollCycle {
    pub name: &'static str,
    pub format: FileNameFormat,
    pub length_ms: i64,
    pub default_index_count: u32,
    pub default_index_spacing: u32,
}

impl RollCycle {
    pub const SECONDLY_TEST: RollCycle =
        RollCycle::new("SECONDLY_TEST", FileNameFormat::Secondly, 1000, 32, 4);
    pub const MINUTELY: RollCycle =
        RollCycle::new("MINUTELY", FileNameFormat::Minutely, MINUTE_MS, 2 << 10, 16);
    pub const HOURLY: RollCycle =
        RollCycle::new("HOURLY", FileNameFormat::Hourly, HOUR_MS, 4 << 10, 16);
    pub const DAILY: RollCycle = RollCycle::new("DAILY", FileNameFormat::Daily, DAY_MS, 8 << 10, 64);
    pub const TEST_DAILY: RollCycle =
        RollCycle::new("TEST_DAILY", FileNameFormat::Daily, DAY_MS, 8, 1);
    pub const TEST2_DAILY: RollCycle =
        RollCycle::new("TEST2_DAILY", FileNameFormat::Daily, DAY_MS, 16, 2);
    pub const TEST4_DAILY: RollCycle =
        RollCycle::new("TEST4_DAILY", FileNameFormat::Daily, DAY_MS, 32, 4);

    pub const fn new(
        name: &'static str,
        format: FileNameFormat,
        length_ms: i64,
        default_index_count: u32,
        default_index_spacing: u32,
    ) -> Self {
        Self {
            name,
            format,
            length_ms,
            default_index_count,
            default_index_spacing,
        }
    }

    /// Number of low index bits holding the in-cycle sequence.
    pub const fn cycle_shift(&self) -> u32 {
        let count_bits = match self.default_index_count.checked_ilog2() {
            Some(bits) => bits,
            None => 0,
        };
        let spacing_bits = match self.default_index_spacing.checked_ilog2() {
            Some(bits) => bits,
            None => 0,
        };
        let bits = count_bits * 2 + spacing_bits;
        if bits > 32 {
            bits
        } else {
            32
        }
    }

    pub const fn sequence_mask(&self) -> u64 {
        (1u64 << self.cycle_shift()) - 1
    }

    pub fn to_index(&self, cycle: i32, sequence: u64) -> u64 {
        ((cycle as u32 as u64) << self.cycle_shift()) | (sequence & self.sequence_mask())
    }

    /// Cycle of `index`; cycles before the epoch are negative.
    pub fn to_cycle(&self, index: u64) -> i32 {
        ((index as i64) >> self.cycle_shift()) as i32
    }

    pub fn to_sequence(&self, index: u64) -> u64 {
        index & self.sequence_mask()
    }

    /// Largest number of excerpts a cycle can hold with the given index geometry.
    pub fn max_messages_per_cycle(&self, index_count: u32, index_spacing: u32) -> u64 {
        let indexed = (index_count as u64)
            .saturating_mul(index_count as u64)
            .saturating_mul(index_spacing as u64);
        indexed.min(self.sequence_mask())
    }

    pub fn cycle_at(&self, time_ms: i64, epoch_ms: i64) -> i32 {
        (time_ms - epoch_ms).div_euclid(self.length_ms) as i32
    }

    pub fn cycle_start_ms(&self, cycle: i32, epoch_ms: i64) -> i64 {
        epoch_ms + cycle as i64 * self.length_ms
    }

    /// Segment file name for `cycle`.
    ///
    /// Names label a cycle by its calendar position counted from the epoch, so with a 05:00
    /// epoch the daily cycle running 05:00 to 05:00 is still named after its start date.
    pub fn file_name(&self, cycle: i32) -> Result<String> {
        let start_ns = cycle as i128 * self.length_ms as i128 * 1_000_000;
        let at = OffsetDateTime::from_unix_timestamp_nanos(start_ns)
            .map_err(|_| Error::Unsupported("cycle start out of calendar range"))?;
        Ok(format!("{}{SEGMENT_SUFFIX}", self.format.render(at)))
    }

    /// Recovers the cycle from a segment file name, or `None` for unrelated files.
    pub fn parse_file_name(&self, name: &str) -> Option<i32> {
        let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
        let start_ms = self.format.parse_ms(stem)?;
        i32::try_from(start_ms.div_euclid(self.length_ms)).ok()
    }
}

impl fmt::Display for RollCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_packs_cycle_and_sequence() {
        let rc = RollCycle::DAILY;
        assert_eq!(rc.cycle_shift(), 32);
        let index = rc.to_index(19_000, 42);
        assert_eq!(rc.to_cycle(index), 19_000);
        assert_eq!(rc.to_sequence(index), 42);
        assert!(rc.to_index(1, 0) > rc.to_index(0, 1_000_000));
    }

    #[test]
    fn cycles_before_the_epoch_survive_a_wide_sequence_field() {
        let wide = RollCycle::new("WIDE", FileNameFormat::Daily, DAY_MS, 1 << 16, 1 << 4);
        assert_eq!(wide.cycle_shift(), 36);
        for rc in [RollCycle::DAILY, wide] {
            let index = rc.to_index(-2, 7);
            assert_eq!(rc.to_cycle(index), -2, "{rc}");
            assert_eq!(rc.to_sequence(index), 7, "{rc}");
        }
    }

    #[test]
    fn file_names_round_trip_for_every_format() {
        let epoch = 0;
        for rc in [
            RollCycle::DAILY,
            RollCycle::HOURLY,
            RollCycle::MINUTELY,
            RollCycle::SECONDLY_TEST,
        ] {
            let cycle = rc.cycle_at(1_700_000_123_456, epoch);
            let name = rc.file_name(cycle).expect("name");
            assert_eq!(rc.parse_file_name(&name), Some(cycle), "{rc}: {name}");
        }
        assert_eq!(
            RollCycle::DAILY.file_name(RollCycle::DAILY.cycle_at(0, 0)).expect("name"),
            "19700101.cq4"
        );
        assert_eq!(
            RollCycle::SECONDLY_TEST.file_name(61).expect("name"),
            "19700101-000101.cq4"
        );
    }

    #[test]
    fn epoch_offset_shifts_cycle_boundaries() {
        let rc = RollCycle::DAILY;
        let epoch = 5 * HOUR_MS;
        assert_eq!(rc.cycle_at(4 * HOUR_MS, epoch), -1);
        assert_eq!(rc.cycle_at(6 * HOUR_MS, epoch), 0);
        assert_eq!(rc.cycle_at(3 * DAY_MS + 6 * HOUR_MS, epoch), 3);
        assert_eq!(rc.file_name(3).expect("name"), "19700104.cq4");
        assert_eq!(rc.parse_file_name("19700104.cq4"), Some(3));
    }

    #[test]
    fn rejects_foreign_names() {
        let rc = RollCycle::DAILY;
        assert_eq!(rc.parse_file_name("queue.meta"), None);
        assert_eq!(rc.parse_file_name("2024011.cq4"), None);
        assert_eq!(rc.parse_file_name("20241301.cq4"), None);
        assert_eq!(rc.parse_file_name("20240101-12.cq4"), None);
    }

    #[test]
    fn capacity_follows_index_geometry() {
        assert_eq!(RollCycle::TEST_DAILY.max_messages_per_cycle(8, 1), 64);
        assert_eq!(RollCycle::TEST4_DAILY.max_messages_per_cycle(32, 4), 4096);
    }
}
