//! JTV guide parser
//!
//! JTV is a legacy binary EPG format: a ZIP archive holding one `.pdt`
//! (title list) and one `.ndx` (schedule) file per channel, paired by
//! file stem. Titles are windows-1251 text behind u16 length prefixes,
//! schedule records carry Windows FILETIME timestamps, and the archive
//! filenames themselves come from CP866 systems.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use codepage_437::{ToCp437, CP437_CONTROL};
use encoding_rs::{IBM866, WINDOWS_1251};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::models::{ChannelGuide, Programme};

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01 (unix epoch).
const FILETIME_UNIX_DIFF: f64 = 11_644_473_600.0;

/// The two known title-file magic headers, differing only in the three
/// trailing filler bytes.
const JTV_HEADERS: [&[u8; 26]; 2] = [
    b"JTV 3.x TV Program Data\x0a\x0a\x0a",
    b"JTV 3.x TV Program Data\xa0\xa0\xa0",
];

/// Decode an 8-byte little-endian Windows FILETIME (100 ns ticks since
/// 1601) into unix seconds, shifted by `timezone_offset` hours and rounded.
///
/// Anything that is not exactly 8 bytes yields the 0 sentinel.
pub fn filetime_to_unix(raw: &[u8], timezone_offset: f64) -> i64 {
    let Ok(bytes) = <[u8; 8]>::try_from(raw) else {
        warn!("broken JTV time detected ({} bytes)", raw.len());
        return 0;
    };
    let filetime = u64::from_le_bytes(bytes);
    let seconds = filetime as f64 / 10_000_000.0 - FILETIME_UNIX_DIFF;
    (seconds + 3600.0 * timezone_offset).round() as i64
}

/// Repair a ZIP entry name written on a legacy Windows system: the name
/// was decoded as CP437 but the underlying bytes are CP866 Cyrillic.
/// Names that do not survive the CP437 leg are kept as-is.
fn fix_zip_filename(name: &str) -> String {
    match name.to_cp437(&CP437_CONTROL) {
        Ok(bytes) => IBM866.decode(&bytes).0.into_owned(),
        Err(_) => name.to_string(),
    }
}

/// Decode a `.pdt` title list: a 26-byte magic header, then
/// `[u16 le length][windows-1251 text]` records until the buffer ends.
fn parse_titles(data: &[u8]) -> Result<Vec<String>> {
    let header = data
        .get(..26)
        .ok_or_else(|| Error::Format("Invalid JTV format".into()))?;
    if !JTV_HEADERS.iter().any(|h| h.as_slice() == header) {
        return Err(Error::Format("Invalid JTV format".into()));
    }
    let mut rest = &data[26..];
    let mut titles = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(Error::Format("Truncated JTV title record".into()));
        }
        let length = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        let take = length.min(rest.len());
        let (raw, tail) = rest.split_at(take);
        titles.push(WINDOWS_1251.decode(raw).0.into_owned());
        rest = tail;
    }
    Ok(titles)
}

/// Decode a `.ndx` schedule: `[u16 le record count]`, then 12-byte records
/// whose middle 8 bytes are the FILETIME start of a programme.
fn parse_schedule(data: &[u8], timezone_offset: f64) -> Result<Vec<i64>> {
    if data.len() < 2 {
        return Err(Error::Format("Truncated JTV schedule".into()));
    }
    let records_num = u16::from_le_bytes([data[0], data[1]]) as usize;
    let mut rest = &data[2..];
    let mut schedule = Vec::with_capacity(records_num);
    for _ in 0..records_num {
        let take = rest.len().min(12);
        let (record, tail) = rest.split_at(take);
        rest = tail;
        let middle = if record.len() >= 4 {
            &record[2..record.len() - 2]
        } else {
            &[][..]
        };
        schedule.push(filetime_to_unix(middle, timezone_offset));
    }
    Ok(schedule)
}

/// Parse a JTV ZIP archive into per-channel programme lists.
///
/// Title *i* pairs with schedule entries *i* (start) and *i+1* (stop);
/// trailing titles without a stop timestamp are dropped. The format
/// carries no descriptions, so `desc` is a single space.
pub fn parse_jtv(bytes: &[u8], timezone_offset: f64) -> Result<ChannelGuide> {
    debug!("Trying parsing as JTV...");
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Format(format!("Not a JTV archive: {e}")))?;

    let mut titles_by_channel: HashMap<String, Vec<String>> = HashMap::new();
    let mut schedule_by_channel: HashMap<String, Vec<i64>> = HashMap::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Error::Format(format!("Bad JTV archive entry: {e}")))?;
        let name = fix_zip_filename(entry.name());
        if !(name.ends_with(".pdt") || name.ends_with(".ndx")) {
            continue;
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::Format(format!("Bad JTV archive entry '{name}': {e}")))?;
        let channel = name[..name.len() - 4].replace('_', " ");
        if name.ends_with(".pdt") {
            titles_by_channel.insert(channel, parse_titles(&data)?);
        } else {
            schedule_by_channel.insert(channel, parse_schedule(&data, timezone_offset)?);
        }
    }

    let mut guide = ChannelGuide::new();
    for (channel, titles) in titles_by_channel {
        let Some(schedule) = schedule_by_channel.get(&channel) else {
            warn!("JTV channel '{channel}' has titles but no schedule");
            continue;
        };
        let mut programmes = Vec::new();
        for (i, title) in titles.into_iter().enumerate() {
            let (Some(&start), Some(&stop)) = (schedule.get(i), schedule.get(i + 1)) else {
                // trailing titles without a schedule slot are dropped
                break;
            };
            programmes.push(Programme {
                start,
                stop,
                title,
                desc: " ".to_string(),
                catchup_id: None,
            });
        }
        guide.insert(channel, programmes);
    }
    Ok(guide)
}
