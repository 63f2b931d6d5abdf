//! Data models for playlist channels and TV guide programmes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single playlist channel as declared by one `#EXTINF` entry.
///
/// Immutable after parsing; absent attributes are empty strings except
/// `catchup_days`, which defaults to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Display title (text after the last comma of the EXTINF line)
    pub title: String,
    /// Alternate name for EPG matching (`tvg-name`)
    pub tvg_name: String,
    /// EPG channel id (`tvg-id`, falling back to `tvg-ID`)
    pub tvg_id: String,
    pub tvg_logo: String,
    /// Group label; locale "All channels" label when the playlist gives none
    pub tvg_group: String,
    /// Per-channel guide URL (`tvg-url`, falling back to `url-tvg`)
    pub tvg_url: String,
    /// Catchup type (`catchup`, falling back to `catchup-type`)
    pub catchup: String,
    pub catchup_source: String,
    /// Days of archive available; 1 when absent or not an integer
    pub catchup_days: u32,
    pub user_agent: String,
    pub referer: String,
    /// Stream URL, after proxy rewriting and Kodi-argument stripping
    pub url: String,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            title: String::new(),
            tvg_name: String::new(),
            tvg_id: String::new(),
            tvg_logo: String::new(),
            tvg_group: String::new(),
            tvg_url: String::new(),
            catchup: String::new(),
            catchup_source: String::new(),
            catchup_days: 1,
            user_agent: String::new(),
            referer: String::new(),
            url: String::new(),
        }
    }
}

/// One scheduled programme from a TV guide source.
///
/// `start`/`stop` are unix seconds; 0 is the sentinel for an unparsable
/// timestamp. `start <= stop` holds for well-formed sources but is not
/// enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Programme {
    pub start: i64,
    pub stop: i64,
    pub title: String,
    pub desc: String,
    pub catchup_id: Option<String>,
}

/// Programmes keyed by the channel display name used in the guide source
/// (not necessarily the playlist's `tvg-name`).
pub type ChannelGuide = HashMap<String, Vec<Programme>>;

/// XMLTV channel id -> display names (an id may carry several)
pub type ChannelIds = HashMap<String, Vec<String>>;

/// Channel display name -> icon URL
pub type IconMap = HashMap<String, String>;

/// Settings for one guide refresh.
#[derive(Debug, Clone)]
pub struct EpgSettings {
    /// Guide locator: local path, URL, or the composite multi-source form
    /// produced by the M3U parser
    pub epg_url: String,
    /// User-Agent header for HTTP fetches
    pub user_agent: String,
    /// Hour offset applied to every XMLTV timestamp (fractional allowed)
    pub epg_offset: f64,
    /// Hour offset applied to JTV schedule timestamps (fractional allowed)
    pub timezone_offset: f64,
    /// How many days back the catchup window reaches
    pub catchup_days: i64,
}

impl Default for EpgSettings {
    fn default() -> Self {
        Self {
            epg_url: String::new(),
            user_agent: String::new(),
            epg_offset: 0.0,
            timezone_offset: 0.0,
            catchup_days: 1,
        }
    }
}
