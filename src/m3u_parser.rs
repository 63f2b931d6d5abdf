//! Extended M3U playlist parser
//!
//! Line-oriented parser producing one [`Channel`] per `#EXTINF`/URL pair.
//! Handles the override tags (`#EXTGRP`, `#EXTLOGO`, `#EXTVLCOPT`),
//! udp/rtp proxy rewriting, Kodi-style pipe arguments on stream URLs and
//! guide-URL discovery from both the header and per-channel attributes.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::Channel;

/// Prefix marking a composite multi-source EPG locator.
pub const MULTIPLE_MARKER: &str = "^^::MULTIPLE::^^";

/// Separator joining the individual locators inside a composite locator.
pub const MULTIPLE_SEPARATOR: &str = ":::^^^:::";

/// Guide URL some providers ship as a header placeholder; treated as absent.
const JTV_PLACEHOLDER_URL: &str = "http://server/jtv.zip";

/// Parse result: the channel list plus the resolved guide locator.
#[derive(Debug, Clone, Default)]
pub struct M3uPlaylist {
    pub channels: Vec<Channel>,
    /// Header guide URL, a composite locator built from per-channel
    /// `tvg-url` attributes, or empty when the playlist declares no guide.
    pub epg_url: String,
}

/// Override tags buffered between an `#EXTINF` line and its URL line.
/// They beat the EXTINF attributes and the Kodi URL arguments.
#[derive(Debug, Default)]
struct TagOverrides {
    group: Option<String>,
    logo: Option<String>,
    user_agent: Option<String>,
    referer: Option<String>,
}

pub struct M3uParser {
    /// Base URL rewriting `udp://`/`rtp://` streams, if configured
    udp_proxy: Option<String>,
    /// Locale-dependent label used when a channel has no group
    all_channels_label: String,
}

impl M3uParser {
    pub fn new(udp_proxy: Option<String>, all_channels_label: impl Into<String>) -> Self {
        Self {
            udp_proxy: udp_proxy.filter(|p| !p.is_empty()),
            all_channels_label: all_channels_label.into(),
        }
    }

    /// Parse a full playlist.
    ///
    /// Fails with [`Error::Format`] when the text carries no
    /// `#EXTM3U`/`#EXTINF` markers or yields no channels.
    pub fn parse(&self, m3u_str: &str) -> Result<M3uPlaylist> {
        if !(m3u_str.contains("#EXTM3U") && m3u_str.contains("#EXTINF")) {
            return Err(Error::Format("Malformed M3U".into()));
        }

        let mut channels: Vec<Channel> = Vec::new();
        let mut epg_urls: Vec<String> = Vec::new();
        let mut header_epg = String::new();
        let mut buffer: Vec<&str> = Vec::new();

        for line in m3u_str.lines() {
            let line = line.trim();
            if line.starts_with("#EXTM3U") {
                if let Some(url) = header_epg_url(line) {
                    header_epg = if url == JTV_PLACEHOLDER_URL {
                        String::new()
                    } else {
                        url
                    };
                }
            } else if line.is_empty() {
                continue;
            } else if line.starts_with('#') {
                buffer.push(line);
            } else {
                // URL line: emit a channel from the buffered tag lines
                let mut extinf: Option<&str> = None;
                let mut overrides = TagOverrides::default();
                for tag_line in &buffer {
                    if tag_line.starts_with("#EXTINF:") {
                        extinf = Some(tag_line);
                    } else if let Some(group) = tag_line.strip_prefix("#EXTGRP:") {
                        let group = group.trim();
                        if !group.is_empty() {
                            overrides.group = Some(group.to_string());
                        }
                    } else if let Some(logo) = tag_line.strip_prefix("#EXTLOGO:") {
                        let logo = logo.trim();
                        if !logo.is_empty() {
                            overrides.logo = Some(logo.to_string());
                        }
                    } else if let Some(opt) = tag_line.strip_prefix("#EXTVLCOPT:") {
                        let opt = opt.trim();
                        if let Some(ua) = opt.strip_prefix("http-user-agent=") {
                            let ua = ua.trim();
                            if !ua.is_empty() {
                                overrides.user_agent = Some(ua.to_string());
                            }
                        } else if let Some(referer) = opt.strip_prefix("http-referrer=") {
                            let referer = referer.trim();
                            if !referer.is_empty() {
                                overrides.referer = Some(referer.to_string());
                            }
                        }
                    }
                }
                if let Some(line_info) = extinf {
                    let channel = self.parse_channel(line_info, line, &overrides);
                    if !channel.tvg_url.is_empty() && !epg_urls.contains(&channel.tvg_url) {
                        epg_urls.push(channel.tvg_url.clone());
                    }
                    channels.push(channel);
                }
                buffer.clear();
            }
        }

        if channels.is_empty() {
            return Err(Error::Format("No channels found".into()));
        }

        let mut epg_url = header_epg;
        if epg_url.is_empty() && !epg_urls.is_empty() {
            epg_url = format!("{}{}", MULTIPLE_MARKER, epg_urls.join(MULTIPLE_SEPARATOR));
        }

        Ok(M3uPlaylist { channels, epg_url })
    }

    /// Build one channel from its EXTINF line, URL line and override tags.
    fn parse_channel(&self, line_info: &str, ch_url: &str, overrides: &TagOverrides) -> Channel {
        let mut url = ch_url.to_string();
        if let Some(proxy) = &self.udp_proxy {
            if url.starts_with("udp://") || url.starts_with("rtp://") {
                url = format!(
                    "{}/{}",
                    proxy,
                    url.replace("udp://", "udp/").replace("rtp://", "rtp/")
                );
                url = url
                    .replace("//udp/", "/udp/")
                    .replace("//rtp/", "/rtp/")
                    .replace('@', "");
            }
        }

        let tvg_url = extract_attr(line_info, "tvg-url")
            .filter(|url| !url.is_empty())
            .or_else(|| extract_attr(line_info, "url-tvg"))
            .unwrap_or_default();

        let group = extract_attr(line_info, "group-title")
            .filter(|group| !group.is_empty())
            .unwrap_or_else(|| self.all_channels_label.clone());

        let catchup = extract_attr(line_info, "catchup")
            .filter(|c| !c.is_empty())
            .or_else(|| extract_attr(line_info, "catchup-type"))
            .unwrap_or_else(|| "default".to_string());

        let tvg_id = extract_attr(line_info, "tvg-id")
            .filter(|id| !id.is_empty())
            .or_else(|| extract_attr(line_info, "tvg-ID"))
            .unwrap_or_default();

        let catchup_days = match extract_attr(line_info, "catchup-days") {
            Some(raw) => raw.parse::<u32>().unwrap_or_else(|_| {
                warn!("M3U STANDARDS VIOLATION: catchup-days is not int (got '{raw}')");
                1
            }),
            None => 1,
        };

        let title = line_info
            .rfind(',')
            .map(|pos| line_info[pos + 1..].trim().to_string())
            .unwrap_or_default();

        let mut channel = Channel {
            title,
            tvg_name: extract_attr(line_info, "tvg-name").unwrap_or_default(),
            tvg_id,
            tvg_logo: extract_attr(line_info, "tvg-logo").unwrap_or_default(),
            tvg_group: group,
            tvg_url,
            catchup,
            catchup_source: extract_attr(line_info, "catchup-source").unwrap_or_default(),
            catchup_days,
            user_agent: extract_attr(line_info, "user-agent").unwrap_or_default(),
            referer: String::new(),
            url,
        };

        let (url, kodi_user_agent, kodi_referer) = parse_url_kodi_arguments(&channel.url);
        channel.url = url;
        if !kodi_user_agent.is_empty() {
            channel.user_agent = kodi_user_agent;
        }
        if !kodi_referer.is_empty() {
            channel.referer = kodi_referer;
        }

        // EXTGRP/EXTLOGO/EXTVLCOPT beat everything parsed above
        if let Some(group) = &overrides.group {
            channel.tvg_group = group.clone();
        }
        if let Some(logo) = &overrides.logo {
            channel.tvg_logo = logo.clone();
        }
        if let Some(user_agent) = &overrides.user_agent {
            channel.user_agent = user_agent.clone();
        }
        if let Some(referer) = &overrides.referer {
            channel.referer = referer.clone();
        }

        channel
    }
}

/// First `name="value"` occurrence in a tag line.
fn extract_attr(line: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = line.find(&needle)?;
    let rest = &line[start + needle.len()..];
    let end = rest.find('"')?;
    Some(rest[..end].trim().to_string())
}

/// Guide URL from the `#EXTM3U` header line, attribute names checked in
/// priority order.
fn header_epg_url(line: &str) -> Option<String> {
    let url = if line.contains("x-tvg-url=\"") {
        extract_attr(line, "x-tvg-url")
    } else if line.contains("tvg-url=\"") {
        extract_attr(line, "tvg-url")
    } else {
        extract_attr(line, "url-tvg")
    };
    url.filter(|url| !url.is_empty())
}

/// Split Kodi-style pipe arguments off a stream URL.
///
/// Returns the truncated URL plus the User-Agent and Referer found after
/// the pipe (empty when absent).
fn parse_url_kodi_arguments(url: &str) -> (String, String, String) {
    let mut user_agent = String::new();
    let mut referer = String::new();
    let Some((base, args)) = url.split_once('|') else {
        return (url.to_string(), user_agent, referer);
    };
    debug!("Found Kodi-style arguments, parsing");
    // Drop anything after a second pipe
    let args = args.split('|').next().unwrap_or(args);
    for arg in args.split('&') {
        if let Some(value) = arg
            .strip_prefix("User-Agent=")
            .or_else(|| arg.strip_prefix("user-agent="))
        {
            debug!("Kodi-style User-Agent found: {value}");
            user_agent = value.to_string();
        } else if let Some(value) = arg
            .strip_prefix("Referer=")
            .or_else(|| arg.strip_prefix("referer="))
        {
            debug!("Kodi-style Referer found: {value}");
            referer = value.to_string();
        }
    }
    (base.to_string(), user_agent, referer)
}
