//! Catalog Parsers
//!
//! Format detection plus one parser per supported source format. Parsing is
//! pure and synchronous; fetching lives in [`super::fetch`].

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use super::{Catalog, CatalogFormat, Channel, DEFAULT_STREAM_TYPE};
use crate::error::{Error, Result};

/// Object members that may hold the channel array of an Xtream response
const XTREAM_LIST_FIELDS: [&str; 3] = ["streams", "channels", "data"];

static ATTRIBUTE_PATTERN: OnceCell<Regex> = OnceCell::new();
static XMLTV_CHANNEL_PATTERN: OnceCell<Regex> = OnceCell::new();
static XMLTV_NAME_PATTERN: OnceCell<Regex> = OnceCell::new();
static XMLTV_ICON_PATTERN: OnceCell<Regex> = OnceCell::new();

fn pattern(cell: &'static OnceCell<Regex>, source: &str) -> Result<&'static Regex> {
    cell.get_or_try_init(|| Regex::new(source))
        .map_err(|e| Error::Internal(format!("invalid pattern {source}: {e}")))
}

fn parse_failure(source: &str, reason: impl Into<String>) -> Error {
    Error::ParseFailure {
        source_url: source.to_string(),
        reason: reason.into(),
    }
}

/// Detect the format of raw catalog text
pub fn detect_format(raw: &str) -> Option<CatalogFormat> {
    let head = raw.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("#EXTM3U") || head.starts_with("#EXTINF") {
        Some(CatalogFormat::M3u)
    } else if head.starts_with('[') || head.starts_with('{') {
        Some(CatalogFormat::Xtream)
    } else if head.starts_with("<?xml") || head.starts_with("<tv") {
        Some(CatalogFormat::Epg)
    } else {
        None
    }
}

/// Detect and parse raw catalog text fetched from `source`
pub fn parse_catalog(source: &str, raw: &str) -> Result<Catalog> {
    let format = detect_format(raw)
        .ok_or_else(|| parse_failure(source, "unrecognized catalog format"))?;
    let channels = match format {
        CatalogFormat::M3u => parse_m3u(raw)?,
        CatalogFormat::Xtream => parse_xtream(source, raw)?,
        CatalogFormat::Epg => parse_xmltv(raw)?,
    };
    tracing::debug!(source = %source, %format, channels = channels.len(), "Parsed catalog");
    Ok(Catalog { format, channels })
}

// =============================================================================
// M3U
// =============================================================================

/// Parse an extended M3U playlist
pub fn parse_m3u(raw: &str) -> Result<Vec<Channel>> {
    let attributes = pattern(&ATTRIBUTE_PATTERN, r#"([A-Za-z0-9_-]+)="([^"]*)""#)?;
    let mut channels = Vec::new();
    let mut pending: Option<Channel> = None;

    for line in raw.lines() {
        let line = line.trim();
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            pending = Some(parse_extinf(info, attributes, channels.len()));
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some(mut channel) = pending.take() {
                channel.url = line.to_string();
                channels.push(channel);
            }
        }
    }
    Ok(channels)
}

fn parse_extinf(info: &str, attributes: &Regex, index: usize) -> Channel {
    let comma = last_top_level_comma(info);
    let attr_part = comma.map_or(info, |i| &info[..i]);
    let title = comma.map(|i| info[i + 1..].trim()).unwrap_or_default();

    let mut channel = Channel::new(String::new(), title, String::new());
    let mut tvg_name = None;
    for cap in attributes.captures_iter(attr_part) {
        let value = cap[2].trim();
        if value.is_empty() {
            continue;
        }
        match &cap[1] {
            "tvg-logo" => channel.logo = Some(value.to_string()),
            "group-title" => channel.group = Some(value.to_string()),
            "tvg-id" => channel.tvg_id = Some(value.to_string()),
            "tvg-name" => tvg_name = Some(value.to_string()),
            _ => {}
        }
    }

    if channel.name.is_empty() {
        channel.name = tvg_name.unwrap_or_else(|| format!("Channel {}", index + 1));
    }
    channel.id = channel
        .tvg_id
        .clone()
        .unwrap_or_else(|| format!("ch_{index}"));
    channel
}

/// Byte index of the last comma outside double quotes
fn last_top_level_comma(info: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut last = None;
    for (i, c) in info.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => last = Some(i),
            _ => {}
        }
    }
    last
}

// =============================================================================
// Xtream-Codes JSON
// =============================================================================

/// Parse an Xtream-Codes stream list
pub fn parse_xtream(source: &str, raw: &str) -> Result<Vec<Channel>> {
    let doc: Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))
        .map_err(|e| parse_failure(source, format!("invalid Xtream JSON: {e}")))?;

    let items = match doc {
        Value::Array(items) => items,
        Value::Object(mut map) => XTREAM_LIST_FIELDS
            .iter()
            .find_map(|field| match map.remove(*field) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| parse_failure(source, "Xtream object has no channel array"))?,
        _ => return Err(parse_failure(source, "Xtream document is not an array or object")),
    };

    Ok(items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| xtream_channel(item, index))
        .collect())
}

fn scalar_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(item: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| scalar_text(item.get(*f)))
}

fn xtream_channel(item: &Value, index: usize) -> Option<Channel> {
    if !item.is_object() {
        return None;
    }
    let id = first_text(item, &["stream_id", "num"]).unwrap_or_else(|| format!("xt_{index}"));
    let name = first_text(item, &["name"]).unwrap_or_else(|| format!("Channel {id}"));
    let url = first_text(item, &["direct_source", "stream_url", "url"]).unwrap_or_default();

    let is_adult = match item.get("is_adult") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1",
        _ => false,
    };

    Some(Channel {
        id,
        name,
        url,
        logo: first_text(item, &["stream_icon"]),
        group: first_text(item, &["category_name", "category_id"]),
        tvg_id: first_text(item, &["epg_channel_id"]),
        stream_type: first_text(item, &["stream_type"])
            .unwrap_or_else(|| DEFAULT_STREAM_TYPE.to_string()),
        is_adult,
    })
}

// =============================================================================
// XMLTV
// =============================================================================

/// Parse the `<channel>` elements of an XMLTV guide
pub fn parse_xmltv(raw: &str) -> Result<Vec<Channel>> {
    let channel_re = pattern(
        &XMLTV_CHANNEL_PATTERN,
        r#"(?s)<channel\s+[^>]*?id="([^"]*)"[^>]*>(.*?)</channel>"#,
    )?;
    let name_re = pattern(&XMLTV_NAME_PATTERN, r#"(?s)<display-name[^>]*>(.*?)</display-name>"#)?;
    let icon_re = pattern(&XMLTV_ICON_PATTERN, r#"<icon\s+[^>]*?src="([^"]*)""#)?;

    Ok(channel_re
        .captures_iter(raw)
        .map(|cap| {
            let id = unescape_xml(&cap[1]);
            let body = &cap[2];
            let name = name_re
                .captures(body)
                .map(|c| unescape_xml(c[1].trim()))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| id.clone());
            let mut channel = Channel::new(id.clone(), name, String::new());
            channel.logo = icon_re.captures(body).map(|c| unescape_xml(&c[1]));
            channel.tvg_id = Some(id);
            channel.stream_type = "epg".to_string();
            channel
        })
        .collect())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="bbc1.uk" tvg-logo="http://logo/bbc1.png" group-title="News, UK",BBC One
http://stream.example.tv/bbc1.m3u8
#EXTINF:-1 tvg-name="Fallback Name" group-title="Sports",
#EXTVLCOPT:http-user-agent=x
http://stream.example.tv/sport.m3u8
#EXTINF:-1,Bare, With Comma
http://stream.example.tv/bare.m3u8
"#;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("#EXTM3U\n"), Some(CatalogFormat::M3u));
        assert_eq!(detect_format("\u{feff}#EXTINF:-1,x"), Some(CatalogFormat::M3u));
        assert_eq!(detect_format("  [ ]"), Some(CatalogFormat::Xtream));
        assert_eq!(detect_format("{\"streams\":[]}"), Some(CatalogFormat::Xtream));
        assert_eq!(detect_format("<?xml version=\"1.0\"?>"), Some(CatalogFormat::Epg));
        assert_eq!(detect_format("<tv>"), Some(CatalogFormat::Epg));
        assert_eq!(detect_format("hello"), None);
    }

    #[test]
    fn test_unknown_format_is_parse_failure() {
        assert_matches!(
            parse_catalog("http://x", "<html>"),
            Err(Error::ParseFailure { .. })
        );
    }

    #[test]
    fn test_parse_m3u() {
        let channels = parse_m3u(PLAYLIST).unwrap();
        assert_eq!(channels.len(), 3);

        assert_eq!(channels[0].id, "bbc1.uk");
        assert_eq!(channels[0].name, "BBC One");
        assert_eq!(channels[0].group.as_deref(), Some("News, UK"));
        assert_eq!(channels[0].logo.as_deref(), Some("http://logo/bbc1.png"));
        assert_eq!(channels[0].url, "http://stream.example.tv/bbc1.m3u8");

        assert_eq!(channels[1].id, "ch_1");
        assert_eq!(channels[1].name, "Fallback Name");
        assert_eq!(channels[1].url, "http://stream.example.tv/sport.m3u8");

        assert_eq!(channels[2].name, "With Comma");
        assert_eq!(channels[2].category(), crate::catalog::UNCATEGORIZED);
    }

    #[test]
    fn test_parse_xtream_array_and_object() {
        let raw = r#"[
            {"num": 1, "name": "Sky", "stream_type": "live", "stream_id": 101,
             "stream_icon": "http://i/1.png", "epg_channel_id": "sky.uk",
             "category_id": "7", "category_name": "Sports", "direct_source": "", "is_adult": "0"},
            {"num": 2, "name": "Late", "category_id": 9, "url": "http://s/2", "is_adult": 1},
            "garbage"
        ]"#;
        let channels = parse_xtream("x", raw).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].id, "101");
        assert_eq!(channels[0].group.as_deref(), Some("Sports"));
        assert_eq!(channels[0].tvg_id.as_deref(), Some("sky.uk"));
        assert_eq!(channels[0].url, "");
        assert_eq!(channels[1].id, "2");
        assert_eq!(channels[1].group.as_deref(), Some("9"));
        assert_eq!(channels[1].stream_type, "live");
        assert!(channels[1].is_adult);

        let wrapped = r#"{"data": [{"stream_id": "5", "name": "Five"}]}"#;
        assert_eq!(parse_xtream("x", wrapped).unwrap()[0].id, "5");

        assert_matches!(parse_xtream("x", r#"{"user_info": {}}"#), Err(Error::ParseFailure { .. }));
        assert_matches!(parse_xtream("x", "[1,"), Err(Error::ParseFailure { .. }));
    }

    #[test]
    fn test_parse_xmltv() {
        let raw = r#"<?xml version="1.0"?>
<tv>
  <channel id="bbc1.uk">
    <display-name lang="en">BBC One &amp; Two</display-name>
    <icon src="http://logo/bbc1.png" />
  </channel>
  <channel id="empty.uk"></channel>
  <programme channel="bbc1.uk" start="20240101"/>
</tv>"#;
        let catalog = parse_catalog("guide.xml", raw).unwrap();
        assert_eq!(catalog.format, CatalogFormat::Epg);
        assert_eq!(catalog.channels.len(), 2);
        assert_eq!(catalog.channels[0].name, "BBC One & Two");
        assert_eq!(catalog.channels[0].logo.as_deref(), Some("http://logo/bbc1.png"));
        assert_eq!(catalog.channels[1].name, "empty.uk");
    }
}
