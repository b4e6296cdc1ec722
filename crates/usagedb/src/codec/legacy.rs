//! Line-oriented tag/attribute snapshot format (schema versions 1 to 3).
//!
//! Every line starts with a tag followed by `key=value` attributes:
//!
//! ```text
//! usagestats endTime=86400000
//! package name=com.example beginTime=0 endTime=86400000 lastTimeActive=500 ...
//! chosen action=android.intent.action.SEND category=text/plain count=3
//! config value=en-US|411|891|420|1|17 lastTimeActive=100 timeActive=5000 count=2
//! active-config value=en-US|411|891|420|1|17
//! events
//! event package=com.example class=com.example.Main time=400 type=1 flags=0
//! ```
//!
//! Times are relative to the snapshot's begin time. Attribute values are
//! percent-escaped so they never contain whitespace, `=`, `|` or `%`.
//! `chosen` lines attach to the preceding `package`, `event` lines require a
//! preceding `events` line, and unknown tags are skipped.

use crate::codec::StatsCodec;
use crate::error::{Result, UsageError};
use crate::stats::{
    Configuration, ConfigurationStats, Event, IntervalStats, Timestamp, UsageStats,
};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use tracing::debug;

const TAG_ROOT: &str = "usagestats";
const TAG_PACKAGE: &str = "package";
const TAG_CHOSEN: &str = "chosen";
const TAG_CONFIG: &str = "config";
const TAG_ACTIVE_CONFIG: &str = "active-config";
const TAG_EVENTS: &str = "events";
const TAG_EVENT: &str = "event";

/// Text codec used by schema versions 1 to 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCodec;

impl StatsCodec for LegacyCodec {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn encode(&self, stats: &IntervalStats) -> Result<Vec<u8>> {
        let mut out = String::with_capacity(512);
        write_stats(&mut out, stats)
            .map_err(|err| UsageError::Encode(format!("legacy stats: {}", err)))?;
        Ok(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8], begin_time: Timestamp) -> Result<IntervalStats> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| UsageError::Decode(format!("legacy stats are not UTF-8: {}", err)))?;
        let abs = |rel: i64| begin_time.wrapping_add(rel);

        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let (tag, root) = parse_line(lines.next().ok_or(UsageError::Truncated("root tag"))?)?;
        if tag != TAG_ROOT {
            return Err(UsageError::Decode(format!(
                "expected <{}> root, found <{}>",
                TAG_ROOT, tag
            )));
        }

        let mut stats = IntervalStats::new(begin_time, abs(root.i64("endTime")?));
        let mut current_package: Option<String> = None;

        for line in lines {
            let (tag, attrs) = parse_line(line)?;
            match tag {
                TAG_PACKAGE => {
                    let mut pkg = UsageStats::new(attrs.string("name")?);
                    pkg.begin_time_stamp = abs(attrs.i64("beginTime")?);
                    pkg.end_time_stamp = abs(attrs.i64("endTime")?);
                    pkg.last_time_used = abs(attrs.i64("lastTimeActive")?);
                    pkg.total_time_in_foreground = attrs.i64("totalTimeActive")?;
                    pkg.launch_count = attrs.u32("launchCount")?;
                    pkg.last_event = attrs.i32("lastEvent")?;
                    current_package = Some(pkg.package_name.clone());
                    stats.package_stats.insert(pkg.package_name.clone(), pkg);
                }
                TAG_CHOSEN => {
                    let pkg = current_package
                        .as_ref()
                        .and_then(|name| stats.package_stats.get_mut(name))
                        .ok_or_else(|| {
                            UsageError::Decode("chooser entry outside a package".to_string())
                        })?;
                    let categories = pkg.chooser_counts.entry(attrs.string("action")?).or_default();
                    if let Some(category) = attrs.optional_string("category")? {
                        categories.insert(category, attrs.u32("count")?);
                    }
                }
                TAG_CONFIG => {
                    let config = parse_config_token(attrs.raw("value")?)?;
                    stats.configurations.insert(
                        config,
                        ConfigurationStats {
                            last_time_active: abs(attrs.i64("lastTimeActive")?),
                            total_time_active: attrs.i64("timeActive")?,
                            activation_count: attrs.u32("count")?,
                        },
                    );
                }
                TAG_ACTIVE_CONFIG => {
                    stats.active_configuration = Some(parse_config_token(attrs.raw("value")?)?);
                }
                TAG_EVENTS => {
                    stats.events.get_or_insert_with(Vec::new);
                }
                TAG_EVENT => {
                    let events = stats.events.as_mut().ok_or_else(|| {
                        UsageError::Decode("event entry outside an events block".to_string())
                    })?;
                    let configuration = match attrs.get("config") {
                        Some(token) => Some(parse_config_token(token)?),
                        None => None,
                    };
                    events.push(Event {
                        package: attrs.string("package")?,
                        class_name: attrs.optional_string("class")?,
                        time_stamp: abs(attrs.i64("time")?),
                        event_type: attrs.i32("type")?,
                        flags: attrs.u32("flags")?,
                        configuration,
                    });
                }
                other => debug!("Skipping unknown legacy stats tag <{}>", other),
            }
        }

        Ok(stats)
    }
}

/// Writes `stats` as tag lines with times relative to its begin time.
fn write_stats(out: &mut String, stats: &IntervalStats) -> fmt::Result {
    let begin = stats.begin_time;
    let rel = |ts: Timestamp| ts.wrapping_sub(begin);

    writeln!(out, "{} endTime={}", TAG_ROOT, rel(stats.end_time))?;

    for pkg in stats.package_stats.values() {
        writeln!(
            out,
            "{} name={} beginTime={} endTime={} lastTimeActive={} totalTimeActive={} launchCount={} lastEvent={}",
            TAG_PACKAGE,
            escape(&pkg.package_name),
            rel(pkg.begin_time_stamp),
            rel(pkg.end_time_stamp),
            rel(pkg.last_time_used),
            pkg.total_time_in_foreground,
            pkg.launch_count,
            pkg.last_event,
        )?;
        for (action, categories) in &pkg.chooser_counts {
            if categories.is_empty() {
                writeln!(out, "{} action={}", TAG_CHOSEN, escape(action))?;
            }
            for (category, count) in categories {
                writeln!(
                    out,
                    "{} action={} category={} count={}",
                    TAG_CHOSEN,
                    escape(action),
                    escape(category),
                    count
                )?;
            }
        }
    }

    for (config, config_stats) in &stats.configurations {
        writeln!(
            out,
            "{} value={} lastTimeActive={} timeActive={} count={}",
            TAG_CONFIG,
            config_token(config),
            rel(config_stats.last_time_active),
            config_stats.total_time_active,
            config_stats.activation_count,
        )?;
    }

    if let Some(config) = &stats.active_configuration {
        writeln!(out, "{} value={}", TAG_ACTIVE_CONFIG, config_token(config))?;
    }

    if let Some(events) = &stats.events {
        writeln!(out, "{}", TAG_EVENTS)?;
        for event in events {
            write!(
                out,
                "{} package={} time={} type={} flags={}",
                TAG_EVENT,
                escape(&event.package),
                rel(event.time_stamp),
                event.event_type,
                event.flags,
            )?;
            if let Some(class_name) = &event.class_name {
                write!(out, " class={}", escape(class_name))?;
            }
            if let Some(config) = &event.configuration {
                write!(out, " config={}", config_token(config))?;
            }
            out.push('\n');
        }
    }

    Ok(())
}

struct Attrs<'a> {
    tag: &'a str,
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Attrs<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.values.get(key).copied()
    }

    fn raw(&self, key: &str) -> Result<&'a str> {
        self.get(key).ok_or_else(|| {
            UsageError::Decode(format!("<{}> is missing attribute {}", self.tag, key))
        })
    }

    fn string(&self, key: &str) -> Result<String> {
        unescape(self.raw(key)?)
    }

    fn optional_string(&self, key: &str) -> Result<Option<String>> {
        self.get(key).map(unescape).transpose()
    }

    fn i64(&self, key: &str) -> Result<i64> {
        self.parse(key)
    }

    fn i32(&self, key: &str) -> Result<i32> {
        self.parse(key)
    }

    fn u32(&self, key: &str) -> Result<u32> {
        self.parse(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.raw(key)?;
        raw.parse().map_err(|_| {
            UsageError::Decode(format!(
                "<{}> attribute {} has invalid value {:?}",
                self.tag, key, raw
            ))
        })
    }
}

fn parse_line(line: &str) -> Result<(&str, Attrs<'_>)> {
    let mut tokens = line.split_whitespace();
    let tag = tokens.next().ok_or(UsageError::Truncated("tag"))?;
    let mut values = HashMap::new();
    for token in tokens {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            UsageError::Decode(format!("<{}> has malformed attribute {:?}", tag, token))
        })?;
        values.insert(key, value);
    }
    Ok((tag, Attrs { tag, values }))
}

fn config_token(config: &Configuration) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        escape(&config.locales),
        config.screen_width_dp,
        config.screen_height_dp,
        config.density_dpi,
        config.orientation,
        config.ui_mode
    )
}

fn parse_config_token(token: &str) -> Result<Configuration> {
    let parts: Vec<&str> = token.split('|').collect();
    let [locales, width, height, density, orientation, ui_mode] = parts[..] else {
        return Err(UsageError::Decode(format!(
            "configuration {:?} does not have six fields",
            token
        )));
    };
    let number = |field: &str| {
        field
            .parse::<u32>()
            .map_err(|_| UsageError::Decode(format!("invalid configuration field {:?}", field)))
    };
    Ok(Configuration {
        locales: unescape(locales)?,
        screen_width_dp: number(width)?,
        screen_height_dp: number(height)?,
        density_dpi: number(density)?,
        orientation: orientation.parse().map_err(|_| {
            UsageError::Decode(format!("invalid configuration orientation {:?}", orientation))
        })?,
        ui_mode: number(ui_mode)?,
    })
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

fn push_escaped_byte(out: &mut String, byte: u8) {
    out.push('%');
    out.push(HEX_DIGITS[usize::from(byte >> 4)] as char);
    out.push(HEX_DIGITS[usize::from(byte & 0x0F)] as char);
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '=' | '|') || ch.is_whitespace() {
            let mut utf8 = [0u8; 4];
            for byte in ch.encode_utf8(&mut utf8).bytes() {
                push_escaped_byte(&mut out, byte);
            }
        } else {
            out.push(ch);
        }
    }
    if out.is_empty() {
        // An empty value would otherwise vanish from the attribute list.
        out.push_str("%00");
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    if value == "%00" {
        return Ok(String::new());
    }
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| UsageError::Decode(format!("invalid escape in {:?}", value)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|err| UsageError::Decode(format!("invalid UTF-8: {}", err)))
}
