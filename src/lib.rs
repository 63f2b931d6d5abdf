//! IPTV playlist and TV guide parsing core
//!
//! Three parsers (extended M3U playlists, XMLTV guides in plain, gzip or
//! lzma form, and legacy JTV binary archives) plus the orchestration
//! that fetches multiple guide sources and merges their per-channel
//! programme lists. Everything is synchronous and holds no
//! cross-call state; the surrounding application decides threading and
//! storage.

pub mod epg;
pub mod error;
pub mod m3u_parser;
pub mod models;


pub use epg::{fetch_epg, load_epg, split_epg_urls, EpgResult, Progress, ProgressFn};
pub use error::{Error, Result};
pub use m3u_parser::{M3uParser, M3uPlaylist, MULTIPLE_MARKER, MULTIPLE_SEPARATOR};
pub use models::{Channel, ChannelGuide, ChannelIds, EpgSettings, IconMap, Programme};
