//! XMLTV guide parser
//!
//! Streaming quick-xml parser for the XMLTV schema. Transparently unwraps
//! gzip and xz/lzma compressed documents, fans programmes out to every
//! display name an id maps to, and keeps only programmes inside the
//! catchup window.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use chrono::{DateTime, Duration, Local, NaiveTime};
use flate2::read::GzDecoder;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::{debug, warn};

use crate::epg::Progress;
use crate::error::{Error, Result};
use crate::models::{ChannelGuide, ChannelIds, IconMap, Programme};

/// Everything one XMLTV document yields.
#[derive(Debug, Clone, Default)]
pub struct XmltvGuide {
    /// Programmes keyed by channel display name, document order
    pub programmes: ChannelGuide,
    /// Channel id -> display names
    pub ids: ChannelIds,
    /// Display name -> first icon URL seen for it
    pub icons: IconMap,
}

/// Parse guide bytes as XMLTV.
///
/// Tries the bytes as plain XML first, then gzip, then xz/lzma. Fails
/// with [`Error::Format`] when no stage produces a well-formed document;
/// the caller falls back to JTV in that case.
pub fn parse_as_xmltv(
    epg: &[u8],
    epg_offset: f64,
    catchup_days: i64,
    progress: &Progress<'_>,
) -> Result<XmltvGuide> {
    debug!("Trying parsing as XMLTV...");
    debug!("catchup-days = {catchup_days}");
    match parse_document(epg, epg_offset, catchup_days) {
        Ok(guide) => Ok(guide),
        Err(_) => {
            progress.stage("unpacking");
            debug!("Trying to unpack as gzip...");
            let unpacked = gunzip(epg).and_then(|xml| {
                progress.stage("parsing");
                parse_document(&xml, epg_offset, catchup_days)
            });
            match unpacked {
                Ok(guide) => Ok(guide),
                Err(_) => {
                    debug!("Trying to unpack as xz...");
                    let xml = unlzma(epg)?;
                    progress.stage("parsing");
                    parse_document(&xml, epg_offset, catchup_days)
                }
            }
        }
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Format(format!("gzip: {e}")))?;
    Ok(out)
}

/// xz container first, then the legacy lzma-alone framing.
fn unlzma(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if lzma_rs::xz_decompress(&mut Cursor::new(data), &mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out)
        .map_err(|e| Error::Format(format!("lzma: {e:?}")))?;
    Ok(out)
}

/// Current position in the document, tracked as a flat state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Channel,
    Programme,
    Title,
    Desc,
    DisplayName,
}

/// A `<programme>` element before id resolution and window filtering.
struct ProgrammeRecord {
    channel_id: String,
    start: i64,
    stop: i64,
    title: String,
    desc: String,
    catchup_id: Option<String>,
}

fn parse_document(xml: &[u8], epg_offset: f64, catchup_days: i64) -> Result<XmltvGuide> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut ids: ChannelIds = HashMap::new();
    let mut icons: IconMap = IconMap::new();
    let mut records: Vec<ProgrammeRecord> = Vec::new();

    let mut state = ParserState::Root;
    let mut saw_root = false;
    let mut channel_id = String::new();
    let mut channel_names: Vec<String> = Vec::new();
    let mut channel_icon: Option<String> = None;
    let mut current: Option<ProgrammeRecord> = None;
    let mut text_buf = String::new();
    let mut buf = Vec::with_capacity(8192);

    loop {
        let position = reader.buffer_position();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name();
                let name_bytes = name.as_ref();
                if !saw_root {
                    // binary junk can decode as stray pseudo-elements;
                    // insist on the XMLTV root before accepting anything
                    if name_bytes != b"tv" {
                        return Err(Error::Format("Not an XMLTV document".into()));
                    }
                    saw_root = true;
                } else {
                    match name_bytes {
                        b"channel" => {
                            state = ParserState::Channel;
                            channel_id =
                                get_attribute(e, b"id").unwrap_or_default().trim().to_string();
                            channel_names.clear();
                            channel_icon = None;
                        }
                        b"programme" => {
                            state = ParserState::Programme;
                            current = Some(programme_record(e, epg_offset));
                        }
                        b"display-name" if state == ParserState::Channel => {
                            state = ParserState::DisplayName;
                            text_buf.clear();
                        }
                        b"icon" if state == ParserState::Channel => {
                            if channel_icon.is_none() {
                                channel_icon =
                                    get_attribute(e, b"src").map(|s| s.trim().to_string());
                            }
                        }
                        b"title" if state == ParserState::Programme => {
                            state = ParserState::Title;
                            text_buf.clear();
                        }
                        b"desc" if state == ParserState::Programme => {
                            state = ParserState::Desc;
                            text_buf.clear();
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Empty(ref e)) => {
                let name = e.name();
                let name_bytes = name.as_ref();
                if !saw_root {
                    if name_bytes != b"tv" {
                        return Err(Error::Format("Not an XMLTV document".into()));
                    }
                    saw_root = true;
                } else {
                    match name_bytes {
                        // self-closing programme: no children, emit directly
                        b"programme" => records.push(programme_record(e, epg_offset)),
                        b"icon" if state == ParserState::Channel => {
                            if channel_icon.is_none() {
                                channel_icon =
                                    get_attribute(e, b"src").map(|s| s.trim().to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if matches!(
                    state,
                    ParserState::Title | ParserState::Desc | ParserState::DisplayName
                ) {
                    let raw = String::from_utf8_lossy(e.as_ref());
                    match unescape(&raw) {
                        Ok(text) => text_buf.push_str(&text),
                        Err(_) => text_buf.push_str(&raw),
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    for name in &channel_names {
                        ids.entry(channel_id.clone()).or_default().push(name.clone());
                        if let Some(icon) = &channel_icon {
                            icons.entry(name.clone()).or_insert_with(|| icon.clone());
                        }
                    }
                    state = ParserState::Root;
                }
                b"programme" => {
                    if let Some(record) = current.take() {
                        records.push(record);
                    }
                    state = ParserState::Root;
                }
                b"display-name" => {
                    let name = text_buf.trim();
                    if !name.is_empty() && !channel_id.is_empty() {
                        channel_names.push(name.to_string());
                    }
                    state = ParserState::Channel;
                }
                b"title" => {
                    if let Some(record) = &mut current {
                        record.title = text_buf.trim().to_string();
                    }
                    state = ParserState::Programme;
                }
                b"desc" => {
                    if let Some(record) = &mut current {
                        record.desc = text_buf.trim().to_string();
                    }
                    state = ParserState::Programme;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Format(format!("XML error at byte {position}: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(Error::Format("Not an XMLTV document".into()));
    }

    let (day_start, day_end) = day_window(catchup_days, epg_offset);
    let mut programmes = ChannelGuide::new();
    for record in records {
        // unknown channel ids are skipped silently
        let Some(names) = ids.get(&record.channel_id) else {
            continue;
        };
        for name in names {
            let entry = programmes.entry(name.clone()).or_default();
            // strict bounds: a boundary-exact programme is excluded
            if record.start > day_start && record.stop < day_end {
                entry.push(Programme {
                    start: record.start,
                    stop: record.stop,
                    title: record.title.clone(),
                    desc: record.desc.clone(),
                    catchup_id: record.catchup_id.clone(),
                });
            }
        }
    }

    Ok(XmltvGuide {
        programmes,
        ids,
        icons,
    })
}

fn programme_record(e: &BytesStart, epg_offset: f64) -> ProgrammeRecord {
    ProgrammeRecord {
        channel_id: get_attribute(e, b"channel")
            .unwrap_or_default()
            .trim()
            .to_string(),
        start: get_attribute(e, b"start")
            .map(|s| parse_xmltv_time(&s, epg_offset))
            .unwrap_or(0),
        stop: get_attribute(e, b"stop")
            .map(|s| parse_xmltv_time(&s, epg_offset))
            .unwrap_or(0),
        title: String::new(),
        desc: String::new(),
        catchup_id: get_attribute(e, b"catchup-id"),
    }
}

fn get_attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            let raw = String::from_utf8_lossy(&attr.value);
            return Some(match unescape(&raw) {
                Ok(text) => text.into_owned(),
                Err(_) => raw.into_owned(),
            });
        }
    }
    None
}

/// Parse a `YYYYMMDDHHMMSS ±HHMM` XMLTV timestamp into unix seconds,
/// shifted by `epg_offset` hours. Malformed input yields the 0 sentinel.
fn parse_xmltv_time(raw: &str, epg_offset: f64) -> i64 {
    match DateTime::parse_from_str(raw.trim(), "%Y%m%d%H%M%S %z") {
        Ok(dt) => (dt.timestamp() as f64 + 3600.0 * epg_offset).round() as i64,
        Err(e) => {
            warn!("unparsable XMLTV timestamp '{raw}': {e}");
            0
        }
    }
}

/// Catchup window bounds: start of day `catchup_days` ago through the end
/// of tomorrow, both in local time shifted by `epg_offset` hours.
pub(crate) fn day_window(catchup_days: i64, epg_offset: f64) -> (i64, i64) {
    let now = Local::now();
    let day_start = (now - Duration::days(catchup_days))
        .with_time(NaiveTime::MIN)
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now.timestamp() - catchup_days * 86_400);
    let day_end = (now + Duration::days(1))
        .with_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap())
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now.timestamp() + 2 * 86_400);
    let shift = (3600.0 * epg_offset).round() as i64;
    (day_start + shift, day_end + shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn xmltv_ts(unix: i64) -> String {
        Utc.timestamp_opt(unix, 0)
            .single()
            .unwrap()
            .format("%Y%m%d%H%M%S +0000")
            .to_string()
    }

    fn now_unix() -> i64 {
        Local::now().timestamp()
    }

    #[test]
    fn test_parse_xmltv_time() {
        let ts = parse_xmltv_time("20240115120000 +0000", 0.0);
        assert_eq!(ts, 1_705_320_000);
        // +0100 is one hour earlier in unix time
        let shifted = parse_xmltv_time("20240115120000 +0100", 0.0);
        assert_eq!(ts - shifted, 3600);
        // epg offset adds hours on top
        assert_eq!(parse_xmltv_time("20240115120000 +0000", 1.0), ts + 3600);
        assert_eq!(parse_xmltv_time("20240115120000 +0000", 0.5), ts + 1800);
    }

    #[test]
    fn test_parse_xmltv_time_malformed_is_zero() {
        assert_eq!(parse_xmltv_time("banana", 0.0), 0);
        assert_eq!(parse_xmltv_time("20240115120000", 0.0), 0);
        assert_eq!(parse_xmltv_time("", 2.0), 0);
    }

    #[test]
    fn test_parse_simple_guide() {
        let start = now_unix();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="bbc1">
    <display-name>BBC One</display-name>
    <display-name>BBC 1</display-name>
    <icon src="http://example.com/bbc1.png"/>
    <icon src="http://example.com/second.png"/>
  </channel>
  <programme start="{}" stop="{}" channel="bbc1" catchup-id="abc">
    <title>News at Noon</title>
    <desc>Daily news broadcast</desc>
  </programme>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 1800)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 1, &Progress::default()).unwrap();

        assert_eq!(
            guide.ids["bbc1"],
            vec!["BBC One".to_string(), "BBC 1".to_string()]
        );
        // first icon wins, and both display names get it
        assert_eq!(guide.icons["BBC One"], "http://example.com/bbc1.png");
        assert_eq!(guide.icons["BBC 1"], "http://example.com/bbc1.png");

        // the programme fans out to every display name of the id
        for name in ["BBC One", "BBC 1"] {
            let programmes = &guide.programmes[name];
            assert_eq!(programmes.len(), 1);
            assert_eq!(programmes[0].title, "News at Noon");
            assert_eq!(programmes[0].desc, "Daily news broadcast");
            assert_eq!(programmes[0].catchup_id.as_deref(), Some("abc"));
            assert_eq!(programmes[0].start, start);
        }
    }

    #[test]
    fn test_window_excludes_old_programmes() {
        let old = now_unix() - 10 * 86_400;
        let xml = format!(
            r#"<tv>
  <channel id="ch"><display-name>Ch</display-name></channel>
  <programme start="{}" stop="{}" channel="ch"><title>Old</title></programme>
</tv>"#,
            xmltv_ts(old),
            xmltv_ts(old + 3600)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 1, &Progress::default()).unwrap();
        // the channel entry is still created, just empty
        assert_eq!(guide.programmes["Ch"], Vec::new());
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let (day_start, day_end) = day_window(3, 0.0);
        let xml = format!(
            r#"<tv>
  <channel id="ch"><display-name>Ch</display-name></channel>
  <programme start="{}" stop="{}" channel="ch"><title>Edge</title></programme>
  <programme start="{}" stop="{}" channel="ch"><title>Inside</title></programme>
</tv>"#,
            xmltv_ts(day_start),
            xmltv_ts(day_end),
            xmltv_ts(day_start + 1),
            xmltv_ts(day_end - 1)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 3, &Progress::default()).unwrap();
        let programmes = &guide.programmes["Ch"];
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].title, "Inside");
    }

    #[test]
    fn test_unknown_channel_id_skipped() {
        let start = now_unix();
        let xml = format!(
            r#"<tv>
  <programme start="{}" stop="{}" channel="ghost"><title>X</title></programme>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 60)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 1, &Progress::default()).unwrap();
        assert!(guide.programmes.is_empty());
    }

    #[test]
    fn test_missing_title_defaults_empty() {
        let start = now_unix();
        let xml = format!(
            r#"<tv>
  <channel id="ch"><display-name>Ch</display-name></channel>
  <programme start="{}" stop="{}" channel="ch"/>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 60)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 1, &Progress::default()).unwrap();
        assert_eq!(guide.programmes["Ch"][0].title, "");
        assert_eq!(guide.programmes["Ch"][0].desc, "");
        assert_eq!(guide.programmes["Ch"][0].catchup_id, None);
    }

    #[test]
    fn test_gzip_unwrap() {
        let start = now_unix();
        let xml = format!(
            r#"<tv>
  <channel id="ch"><display-name>Ch</display-name></channel>
  <programme start="{}" stop="{}" channel="ch"><title>Packed</title></programme>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 60)
        );
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let packed = encoder.finish().unwrap();

        let guide = parse_as_xmltv(&packed, 0.0, 1, &Progress::default()).unwrap();
        assert_eq!(guide.programmes["Ch"][0].title, "Packed");
    }

    #[test]
    fn test_lzma_unwrap() {
        let start = now_unix();
        let xml = format!(
            r#"<tv>
  <channel id="ch"><display-name>Ch</display-name></channel>
  <programme start="{}" stop="{}" channel="ch"><title>Squeezed</title></programme>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 60)
        );
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(xml.as_bytes()), &mut packed).unwrap();

        let guide = parse_as_xmltv(&packed, 0.0, 1, &Progress::default()).unwrap();
        assert_eq!(guide.programmes["Ch"][0].title, "Squeezed");
    }

    #[test]
    fn test_garbage_is_format_error() {
        let result = parse_as_xmltv(b"PK\x03\x04 definitely not a guide", 0.0, 1, &Progress::default());
        assert!(matches!(result, Err(Error::Format(_))));
        assert!(matches!(
            parse_as_xmltv(b"", 0.0, 1, &Progress::default()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_shared_display_name_across_ids() {
        let start = now_unix();
        let xml = format!(
            r#"<tv>
  <channel id="one"><display-name>Same</display-name></channel>
  <channel id="two"><display-name>Same</display-name></channel>
  <programme start="{}" stop="{}" channel="one"><title>A</title></programme>
  <programme start="{}" stop="{}" channel="two"><title>A</title></programme>
</tv>"#,
            xmltv_ts(start),
            xmltv_ts(start + 60),
            xmltv_ts(start),
            xmltv_ts(start + 60)
        );
        let guide = parse_as_xmltv(xml.as_bytes(), 0.0, 1, &Progress::default()).unwrap();
        assert_eq!(guide.programmes["Same"].len(), 2);
        assert_eq!(guide.ids["one"], vec!["Same"]);
        assert_eq!(guide.ids["two"], vec!["Same"]);
    }
}
