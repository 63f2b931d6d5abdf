//! EPG (Electronic Program Guide) module
//!
//! Fetches one or more guide sources (local file or HTTP), parses each as
//! XMLTV with a JTV fallback, and merges the results. Sources are
//! processed strictly sequentially; a failed source only loses its own
//! contribution unless every source fails.

pub mod jtv;
pub mod xmltv;

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::m3u_parser::{MULTIPLE_MARKER, MULTIPLE_SEPARATOR};
use crate::models::{ChannelGuide, ChannelIds, EpgSettings, IconMap};
use xmltv::XmltvGuide;

/// Per-source fetch timeout. No retries; a slow source only costs its own
/// contribution.
const FETCH_TIMEOUT: Duration = Duration::from_secs(35);

/// Status-string sink for guide refresh progress.
pub type ProgressFn = dyn Fn(&str) + Send + Sync;

/// Progress context for one source out of a set.
pub struct Progress<'a> {
    sink: Option<&'a ProgressFn>,
    source_index: usize,
    source_count: usize,
}

impl<'a> Progress<'a> {
    pub fn new(sink: Option<&'a ProgressFn>, source_index: usize, source_count: usize) -> Self {
        Self {
            sink,
            source_index,
            source_count,
        }
    }

    pub(crate) fn stage(&self, stage: &str) {
        if let Some(sink) = self.sink {
            sink(&format!(
                "Updating TV guide... ({} {}/{})",
                stage, self.source_index, self.source_count
            ));
        }
    }
}

impl Default for Progress<'static> {
    fn default() -> Self {
        Self::new(None, 1, 1)
    }
}

/// Merged result of one guide refresh.
#[derive(Debug, Default)]
pub struct EpgResult {
    pub programmes: ChannelGuide,
    pub ids: ChannelIds,
    pub icons: IconMap,
    /// False only when every source failed
    pub ok: bool,
    /// First captured error, set when `ok` is false
    pub error: Option<Error>,
    /// How many sources failed (diagnostics; partial failure keeps `ok`)
    pub failures: usize,
}

/// Expand a guide locator into its individual sources.
///
/// Understands the composite `MULTIPLE_MARKER`/`MULTIPLE_SEPARATOR` form
/// produced by the M3U parser; a plain comma-separated list is normalized
/// into it first.
pub fn split_epg_urls(epg_url: &str) -> Vec<String> {
    let mut url = epg_url.to_string();
    if url.contains(',') && !url.starts_with(MULTIPLE_MARKER) {
        url = format!(
            "{}{}",
            MULTIPLE_MARKER,
            url.split(',').collect::<Vec<_>>().join(MULTIPLE_SEPARATOR)
        );
    }
    match url.strip_prefix(MULTIPLE_MARKER) {
        Some(rest) => rest.split(MULTIPLE_SEPARATOR).map(str::to_string).collect(),
        None => vec![url],
    }
}

/// Fetch raw guide bytes from a local path or an HTTP(S) URL.
pub fn load_epg(epg_url: &str, user_agent: &str) -> Result<Vec<u8>> {
    info!("Loading EPG...");
    info!("Address: '{epg_url}'");
    if Path::new(epg_url).is_file() {
        let epg = std::fs::read(epg_url)
            .map_err(|e| Error::Fetch(format!("Reading '{epg_url}': {e}")))?;
        info!("EPG loaded");
        return Ok(epg);
    }

    let agent = ureq::Agent::config_builder()
        .timeout_global(Some(FETCH_TIMEOUT))
        .build()
        .new_agent();
    let response = agent
        .get(epg_url)
        .header("User-Agent", user_agent)
        .call()
        .map_err(|e| Error::Fetch(format!("Request failed: {e}")))?;
    info!("EPG URL status code: {}", response.status());
    if response.status() != 200 {
        return Err(Error::Fetch(format!("HTTP error: {}", response.status())));
    }
    let mut epg = Vec::new();
    response
        .into_body()
        .into_reader()
        .read_to_end(&mut epg)
        .map_err(|e| Error::Fetch(format!("Read failed: {e}")))?;
    info!("EPG loaded");
    Ok(epg)
}

/// One source's parse output.
enum SourceGuide {
    Xmltv(XmltvGuide),
    Jtv(ChannelGuide),
}

fn fetch_one(url: &str, settings: &EpgSettings, progress: &Progress<'_>) -> Result<SourceGuide> {
    progress.stage("loading");
    let epg = load_epg(url, &settings.user_agent)?;
    progress.stage("parsing");
    match xmltv::parse_as_xmltv(&epg, settings.epg_offset, settings.catchup_days, progress) {
        Ok(guide) => Ok(SourceGuide::Xmltv(guide)),
        Err(err) => {
            debug!("XMLTV parsing failed ({err}), trying JTV");
            Ok(SourceGuide::Jtv(jtv::parse_jtv(
                &epg,
                settings.timezone_offset,
            )?))
        }
    }
}

/// Fetch and merge every guide source named by `settings.epg_url`.
///
/// Later sources overwrite same-named channels wholesale; programme lists
/// are never concatenated across sources.
pub fn fetch_epg(settings: &EpgSettings, sink: Option<&ProgressFn>) -> EpgResult {
    let urls = split_epg_urls(&settings.epg_url);
    let mut result = EpgResult::default();
    let mut errors: Vec<Error> = Vec::new();
    let mut any_ok = false;

    for (i, url) in urls.iter().enumerate() {
        let progress = Progress::new(sink, i + 1, urls.len());
        match fetch_one(url, settings, &progress) {
            Ok(SourceGuide::Xmltv(guide)) => {
                result.programmes.extend(guide.programmes);
                result.ids.extend(guide.ids);
                result.icons.extend(guide.icons);
                any_ok = true;
                info!("Parsing done!");
            }
            Ok(SourceGuide::Jtv(guide)) => {
                result.programmes.extend(guide);
                any_ok = true;
                info!("Parsing done!");
            }
            Err(err) => {
                warn!("Failed parsing EPG: {err}");
                errors.push(err);
            }
        }
    }

    if let Some(sink) = sink {
        sink("");
    }
    info!("Parsing EPG done!");

    result.failures = errors.len();
    result.ok = any_ok;
    if !any_ok {
        result.error = errors.into_iter().next();
    }
    result
}
