//! HLS playlist parsing on top of `m3u8-rs`
//!
//! A line pass runs first so that a malformed directive is reported with its
//! line number and content. Tags and attributes are then read by `m3u8-rs`
//! and mapped onto the crate's playlist models.

use crate::playlist::models::{
    MasterPlaylist, MediaPlaylist, Playlist, Rendition, RenditionKind, Segment,
};
use crate::utils::error::ParseError;
use std::collections::HashMap;
use tracing::debug;

const TOTAL_SECS_TAG: &str = "X-TWITCH-TOTAL-SECS";

/// Parse playlist text into a master or media playlist
pub fn parse(text: &str) -> Result<Playlist, ParseError> {
    let text = text.trim_start_matches('\u{feff}');
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    let header = match lines.first() {
        Some(&(_, "#EXTM3U")) => lines[0],
        Some(&(n, other)) => return Err(ParseError::new(n, other, "missing #EXTM3U header")),
        None => return Err(ParseError::new(1, "", "empty playlist")),
    };

    let is_master = text.contains("#EXT-X-STREAM-INF");
    if is_master {
        check_master_lines(&lines[1..])?;
    } else {
        check_media_lines(&lines[1..])?;
    }

    let parsed = m3u8_rs::parse_playlist_res(text.trim_start().as_bytes()).map_err(|e| {
        debug!("m3u8-rs rejected playlist: {}", e);
        ParseError::new(header.0, header.1, "malformed playlist")
    })?;

    let playlist = match parsed {
        m3u8_rs::Playlist::MasterPlaylist(master) => Playlist::Master(map_master(master)),
        m3u8_rs::Playlist::MediaPlaylist(media) => Playlist::Media(map_media(media)),
    };

    debug!(
        "Parsed {} playlist",
        if matches!(playlist, Playlist::Master(_)) { "master" } else { "media" }
    );
    Ok(playlist)
}

fn map_master(master: m3u8_rs::MasterPlaylist) -> MasterPlaylist {
    // GROUP-ID -> NAME from #EXT-X-MEDIA, first declaration wins
    let mut group_names: HashMap<String, String> = HashMap::new();
    for alt in &master.alternatives {
        group_names
            .entry(alt.group_id.clone())
            .or_insert_with(|| alt.name.clone());
    }

    let renditions = master
        .variants
        .into_iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| {
            let resolution = v.resolution.map(|r| (r.width as u32, r.height as u32));
            let label = v
                .video
                .as_ref()
                .map(|g| group_names.get(g).cloned().unwrap_or_else(|| g.clone()));
            let kind = match &label {
                Some(l) => RenditionKind::from_label(l),
                None if resolution.is_none() && is_audio_codecs(v.codecs.as_deref()) => {
                    RenditionKind::AudioOnly
                }
                None => RenditionKind::Video,
            };
            let name = label.unwrap_or_else(|| match resolution {
                Some((_, h)) => format!("{}p", h),
                None => format!("{}", v.bandwidth),
            });
            Rendition {
                name,
                kind,
                bandwidth: v.bandwidth,
                resolution,
                frame_rate: v.frame_rate,
                codecs: v.codecs,
                uri: v.uri,
            }
        })
        .collect();

    MasterPlaylist { renditions }
}

fn map_media(media: m3u8_rs::MediaPlaylist) -> MediaPlaylist {
    // Unknown tags land on the playlist or on the segment that follows them
    let total_secs = media
        .unknown_tags
        .iter()
        .chain(media.segments.iter().flat_map(|s| s.unknown_tags.iter()))
        .rev()
        .find(|t| t.tag == TOTAL_SECS_TAG)
        .and_then(|t| t.rest.as_deref())
        .and_then(|rest| parse_seconds(rest.trim()));

    let segments = media
        .segments
        .into_iter()
        .enumerate()
        .map(|(i, s)| Segment {
            index: media.media_sequence + i as u64,
            duration: widen_duration(s.duration),
            uri: s.uri,
            byte_len: None,
        })
        .collect();

    MediaPlaylist {
        segments,
        target_duration: (media.target_duration > 0).then_some(media.target_duration as f64),
        media_sequence: media.media_sequence,
        end_list: media.end_list,
        total_secs,
    }
}

/// `m3u8-rs` keeps `#EXTINF` durations as `f32`; playlists carry milliseconds
fn widen_duration(duration: f32) -> f64 {
    (f64::from(duration) * 1000.0).round() / 1000.0
}

fn is_audio_codecs(codecs: Option<&str>) -> bool {
    match codecs {
        Some(c) => c
            .split(',')
            .all(|codec| codec.trim().starts_with("mp4a")),
        None => false,
    }
}

fn check_master_lines(lines: &[(usize, &str)]) -> Result<(), ParseError> {
    let mut pending: Option<(usize, &str)> = None;

    for &(n, line) in lines {
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            if let Some((prev_line, prev)) = pending {
                return Err(ParseError::new(
                    prev_line,
                    prev,
                    "stream info without a playlist URI",
                ));
            }
            check_stream_inf(n, line, rest)?;
            pending = Some((n, line));
        } else if !line.starts_with('#') {
            pending = None;
        }
    }

    match pending {
        Some((n, line)) => Err(ParseError::new(n, line, "stream info without a playlist URI")),
        None => Ok(()),
    }
}

fn check_stream_inf(n: usize, line: &str, rest: &str) -> Result<(), ParseError> {
    let attrs = parse_attributes(rest);

    attrs
        .get("BANDWIDTH")
        .ok_or_else(|| ParseError::new(n, line, "missing BANDWIDTH"))?
        .parse::<u64>()
        .map_err(|_| ParseError::new(n, line, "invalid BANDWIDTH"))?;

    if let Some(value) = attrs.get("RESOLUTION") {
        let valid = value
            .split_once(|c: char| c == 'x' || c == 'X')
            .is_some_and(|(w, h)| w.parse::<u32>().is_ok() && h.parse::<u32>().is_ok());
        if !valid {
            return Err(ParseError::new(n, line, "invalid RESOLUTION"));
        }
    }

    if let Some(value) = attrs.get("FRAME-RATE") {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| ParseError::new(n, line, "invalid FRAME-RATE"))?;
    }

    Ok(())
}

fn check_media_lines(lines: &[(usize, &str)]) -> Result<(), ParseError> {
    let mut pending: Option<(usize, &str)> = None;
    let mut seen_segment = false;

    for &(n, line) in lines {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some((prev_line, prev)) = pending {
                return Err(ParseError::new(prev_line, prev, "segment info without a URI"));
            }
            let value = rest.split(',').next().unwrap_or("").trim();
            parse_seconds(value)
                .ok_or_else(|| ParseError::new(n, line, "invalid segment duration"))?;
            pending = Some((n, line));
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            rest.trim()
                .parse::<u64>()
                .map_err(|_| ParseError::new(n, line, "invalid target duration"))?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if seen_segment || pending.is_some() {
                return Err(ParseError::new(n, line, "media sequence after first segment"));
            }
            rest.trim()
                .parse::<u64>()
                .map_err(|_| ParseError::new(n, line, "invalid media sequence"))?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TWITCH-TOTAL-SECS:") {
            parse_seconds(rest.trim())
                .ok_or_else(|| ParseError::new(n, line, "invalid total seconds"))?;
        } else if !line.starts_with('#') {
            pending
                .take()
                .ok_or_else(|| ParseError::new(n, line, "URI without #EXTINF"))?;
            seen_segment = true;
        }
    }

    match pending {
        Some((n, line)) => Err(ParseError::new(n, line, "segment info without a URI")),
        None => Ok(()),
    }
}

fn parse_seconds(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Split an attribute list, honoring quoted values that contain commas
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quoted = false;

    let mut flush = |key: &mut String, value: &mut String| {
        let k = key.trim();
        if !k.is_empty() {
            attrs.insert(k.to_string(), value.trim().to_string());
        }
        key.clear();
        value.clear();
    };

    for ch in input.chars() {
        match ch {
            '"' if in_value => quoted = !quoted,
            '=' if !in_value => in_value = true,
            ',' if !quoted => {
                flush(&mut key, &mut value);
                in_value = false;
            }
            _ if in_value => value.push(ch),
            _ => key.push(ch),
        }
    }
    flush(&mut key, &mut value);

    attrs
}
