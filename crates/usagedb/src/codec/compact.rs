//! Compact binary snapshot format (schema version 4).
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Magic: "USTB" (4 bytes)                                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Body                                                        │
//! │  - end time (zig-zag varint, relative to begin time)         │
//! │  - packages: count, then name, times, counters, choosers     │
//! │  - configurations: count, then descriptor + counters         │
//! │  - active configuration: presence byte + descriptor          │
//! │  - events: presence byte, count, then one record per event   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer: CRC32 of the body (u32 LE)                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are stored as signed deltas from the snapshot's begin time;
//! durations and counters as unsigned or zig-zag LEB128 varints.

use crate::codec::StatsCodec;
use crate::error::{Result, UsageError};
use crate::stats::{
    Configuration, ConfigurationStats, Event, IntervalStats, Timestamp, UsageStats,
};
use std::collections::BTreeMap;

/// Magic bytes at the start of every compact snapshot: "USTB".
pub const COMPACT_MAGIC: [u8; 4] = *b"USTB";

/// Magic plus footer size in bytes.
const FRAME_OVERHEAD: usize = 8;

/// Binary codec used by schema version 4.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCodec;

impl StatsCodec for CompactCodec {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn encode(&self, stats: &IntervalStats) -> Result<Vec<u8>> {
        let mut body = BodyWriter::new(stats.begin_time);
        body.write_stats(stats);

        let crc = crc32fast::hash(&body.buf);
        let mut out = Vec::with_capacity(body.buf.len() + FRAME_OVERHEAD);
        out.extend_from_slice(&COMPACT_MAGIC);
        out.extend_from_slice(&body.buf);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], begin_time: Timestamp) -> Result<IntervalStats> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(UsageError::Truncated("compact frame"));
        }
        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != COMPACT_MAGIC {
            return Err(UsageError::InvalidMagic(magic));
        }

        let footer_at = bytes.len() - 4;
        let body = &bytes[4..footer_at];
        let expected = u32::from_le_bytes([
            bytes[footer_at],
            bytes[footer_at + 1],
            bytes[footer_at + 2],
            bytes[footer_at + 3],
        ]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(UsageError::ChecksumMismatch { expected, actual });
        }

        let mut reader = BodyReader::new(body, begin_time);
        let stats = reader.read_stats()?;
        if reader.remaining() != 0 {
            return Err(UsageError::Decode(format!(
                "{} trailing bytes after snapshot body",
                reader.remaining()
            )));
        }
        Ok(stats)
    }
}

struct BodyWriter {
    buf: Vec<u8>,
    begin_time: Timestamp,
}

impl BodyWriter {
    fn new(begin_time: Timestamp) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            begin_time,
        }
    }

    fn write_stats(&mut self, stats: &IntervalStats) {
        self.put_time(stats.end_time);

        self.put_len(stats.package_stats.len());
        for pkg in stats.package_stats.values() {
            self.put_str(&pkg.package_name);
            self.put_time(pkg.begin_time_stamp);
            self.put_time(pkg.end_time_stamp);
            self.put_time(pkg.last_time_used);
            self.put_i64(pkg.total_time_in_foreground);
            self.put_varint(u64::from(pkg.launch_count));
            self.put_i64(i64::from(pkg.last_event));
            self.put_len(pkg.chooser_counts.len());
            for (action, categories) in &pkg.chooser_counts {
                self.put_str(action);
                self.put_len(categories.len());
                for (category, count) in categories {
                    self.put_str(category);
                    self.put_varint(u64::from(*count));
                }
            }
        }

        self.put_len(stats.configurations.len());
        for (config, config_stats) in &stats.configurations {
            self.put_config(config);
            self.put_time(config_stats.last_time_active);
            self.put_i64(config_stats.total_time_active);
            self.put_varint(u64::from(config_stats.activation_count));
        }

        self.put_bool(stats.active_configuration.is_some());
        if let Some(config) = &stats.active_configuration {
            self.put_config(config);
        }

        self.put_bool(stats.events.is_some());
        if let Some(events) = &stats.events {
            self.put_len(events.len());
            for event in events {
                self.put_str(&event.package);
                self.put_bool(event.class_name.is_some());
                if let Some(class_name) = &event.class_name {
                    self.put_str(class_name);
                }
                self.put_time(event.time_stamp);
                self.put_i64(i64::from(event.event_type));
                self.put_varint(u64::from(event.flags));
                self.put_bool(event.configuration.is_some());
                if let Some(config) = &event.configuration {
                    self.put_config(config);
                }
            }
        }
    }

    fn put_config(&mut self, config: &Configuration) {
        self.put_str(&config.locales);
        self.put_varint(u64::from(config.screen_width_dp));
        self.put_varint(u64::from(config.screen_height_dp));
        self.put_varint(u64::from(config.density_dpi));
        self.buf.push(config.orientation);
        self.put_varint(u64::from(config.ui_mode));
    }

    fn put_time(&mut self, ts: Timestamp) {
        self.put_i64(ts.wrapping_sub(self.begin_time));
    }

    fn put_i64(&mut self, value: i64) {
        self.put_varint(((value << 1) ^ (value >> 63)) as u64);
    }

    fn put_len(&mut self, len: usize) {
        self.put_varint(len as u64);
    }

    fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn put_str(&mut self, value: &str) {
        self.put_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn put_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
    begin_time: Timestamp,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8], begin_time: Timestamp) -> Self {
        Self {
            buf,
            pos: 0,
            begin_time,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_stats(&mut self) -> Result<IntervalStats> {
        let mut stats = IntervalStats::new(self.begin_time, 0);
        stats.end_time = self.get_time()?;

        let package_count = self.get_len("package count")?;
        for _ in 0..package_count {
            let pkg = self.get_package()?;
            stats.package_stats.insert(pkg.package_name.clone(), pkg);
        }

        let config_count = self.get_len("configuration count")?;
        for _ in 0..config_count {
            let config = self.get_config()?;
            let config_stats = ConfigurationStats {
                last_time_active: self.get_time()?,
                total_time_active: self.get_i64()?,
                activation_count: self.get_u32("activation count")?,
            };
            stats.configurations.insert(config, config_stats);
        }

        if self.get_bool()? {
            stats.active_configuration = Some(self.get_config()?);
        }

        if self.get_bool()? {
            let event_count = self.get_len("event count")?;
            let mut events = Vec::with_capacity(event_count.min(self.remaining()));
            for _ in 0..event_count {
                events.push(self.get_event()?);
            }
            stats.events = Some(events);
        }

        Ok(stats)
    }

    fn get_package(&mut self) -> Result<UsageStats> {
        let mut pkg = UsageStats::new(self.get_str()?);
        pkg.begin_time_stamp = self.get_time()?;
        pkg.end_time_stamp = self.get_time()?;
        pkg.last_time_used = self.get_time()?;
        pkg.total_time_in_foreground = self.get_i64()?;
        pkg.launch_count = self.get_u32("launch count")?;
        pkg.last_event = self.get_i32("last event")?;

        let action_count = self.get_len("chooser action count")?;
        for _ in 0..action_count {
            let action = self.get_str()?;
            let category_count = self.get_len("chooser category count")?;
            let mut categories = BTreeMap::new();
            for _ in 0..category_count {
                let category = self.get_str()?;
                categories.insert(category, self.get_u32("chooser count")?);
            }
            pkg.chooser_counts.insert(action, categories);
        }
        Ok(pkg)
    }

    fn get_event(&mut self) -> Result<Event> {
        let package = self.get_str()?;
        let class_name = if self.get_bool()? {
            Some(self.get_str()?)
        } else {
            None
        };
        let time_stamp = self.get_time()?;
        let event_type = self.get_i32("event type")?;
        let flags = self.get_u32("event flags")?;
        let configuration = if self.get_bool()? {
            Some(self.get_config()?)
        } else {
            None
        };
        Ok(Event {
            package,
            class_name,
            time_stamp,
            event_type,
            flags,
            configuration,
        })
    }

    fn get_config(&mut self) -> Result<Configuration> {
        Ok(Configuration {
            locales: self.get_str()?,
            screen_width_dp: self.get_u32("screen width")?,
            screen_height_dp: self.get_u32("screen height")?,
            density_dpi: self.get_u32("density")?,
            orientation: self.get_u8("orientation")?,
            ui_mode: self.get_u32("ui mode")?,
        })
    }

    fn get_time(&mut self) -> Result<Timestamp> {
        Ok(self.begin_time.wrapping_add(self.get_i64()?))
    }

    fn get_i64(&mut self) -> Result<i64> {
        let raw = self.get_varint("signed varint")?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn get_i32(&mut self, what: &'static str) -> Result<i32> {
        i32::try_from(self.get_i64()?)
            .map_err(|_| UsageError::Decode(format!("{} out of range", what)))
    }

    fn get_u32(&mut self, what: &'static str) -> Result<u32> {
        u32::try_from(self.get_varint(what)?)
            .map_err(|_| UsageError::Decode(format!("{} out of range", what)))
    }

    fn get_len(&mut self, what: &'static str) -> Result<usize> {
        let len = self.get_varint(what)?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or_else(|| UsageError::Decode(format!("{} {} exceeds payload", what, len)))
    }

    fn get_u8(&mut self, what: &'static str) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or(UsageError::Truncated(what))?;
        self.pos += 1;
        Ok(byte)
    }

    fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8("presence flag")? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(UsageError::Decode(format!("invalid presence flag {}", other))),
        }
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_len("string length")?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| UsageError::Decode(format!("invalid UTF-8 string: {}", err)))
    }

    fn get_varint(&mut self, what: &'static str) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.get_u8(what)?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(UsageError::Decode(format!("{} varint overflows 64 bits", what)))
    }
}
