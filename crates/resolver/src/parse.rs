// Pure parsing of extractor output, kept separate from the subprocess
// plumbing so it can be tested without the binary.

use crate::{Quality, ResolverError};
use serde::Deserialize;
use url::Url;

/// Markers the extractor prints for a broadcast that has not gone live.
const NOT_STARTED_MARKERS: [&str; 3] = [
    "This live event will begin in",
    "Premieres in",
    "Premiere will begin",
];

pub(crate) fn marks_not_started(output: &str) -> bool {
    NOT_STARTED_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
}

#[derive(Debug, Deserialize)]
struct FormatListing {
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    resolution: Option<String>,
    vbr: Option<f64>,
}

/// Parses the JSON format listing out of the extractor's combined output.
/// The extractor prints progress lines before the JSON document; the first
/// `{` byte marks the start.
pub(crate) fn parse_quality_listing(output: &str) -> Result<Vec<Quality>, ResolverError> {
    let json_begin = output
        .find('{')
        .ok_or_else(|| ResolverError::parse("no JSON document in output"))?;
    let listing: FormatListing = serde_json::from_str(&output[json_begin..])
        .map_err(|e| ResolverError::parse(e.to_string()))?;

    let mut qualities: Vec<Quality> = listing
        .formats
        .into_iter()
        .filter_map(|format| {
            // Non-numeric format ids (storyboards, audio-only aliases) are
            // not requestable qualities.
            let code = format.format_id.parse::<i32>().ok()?;
            Some(Quality {
                code,
                resolution: format.resolution.unwrap_or_else(|| "unknown".to_string()),
                vbr: format.vbr.unwrap_or(0.0),
                best: false,
            })
        })
        .collect();

    if qualities.is_empty() {
        return Err(ResolverError::NoQualities);
    }

    mark_best(&mut qualities);
    Ok(qualities)
}

/// Flags the entry with the highest video bitrate; ties keep the first seen.
fn mark_best(qualities: &mut [Quality]) {
    let mut best_index = 0;
    let mut best_vbr: Option<f64> = None;
    for (index, quality) in qualities.iter().enumerate() {
        if best_vbr.is_none_or(|vbr| quality.vbr > vbr) {
            best_index = index;
            best_vbr = Some(quality.vbr);
        }
    }
    qualities[best_index].best = true;
}

/// The playlist resolution prints one URL per line; the media playlist is
/// the first line ending in `.m3u8`.
pub(crate) fn first_playlist_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.ends_with(".m3u8"))
        .map(str::to_string)
}

/// Extracts the broadcast ID from a watch URL.
pub fn parse_broadcast_id(broadcast_url: &str) -> Result<String, ResolverError> {
    let invalid = || ResolverError::InvalidUrl {
        input: broadcast_url.to_string(),
    };
    let parsed = Url::parse(broadcast_url).map_err(|_| invalid())?;

    let host = parsed
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
        .unwrap_or_default();

    let id = match host.as_str() {
        // https://youtu.be/2naTB5J0jfI
        "youtu.be" => parsed.path().trim_start_matches('/').to_string(),
        // https://www.youtube.com/watch?v=2naTB5J0jfI
        "youtube.com" => parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };

    if id.is_empty() {
        return Err(invalid());
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_watch_urls() {
        assert_eq!(
            parse_broadcast_id("https://youtu.be/2naTB5J0jfI").unwrap(),
            "2naTB5J0jfI"
        );
    }

    #[test]
    fn parses_long_watch_urls() {
        assert_eq!(
            parse_broadcast_id("https://www.youtube.com/watch?v=2naTB5J0jfI").unwrap(),
            "2naTB5J0jfI"
        );
        assert_eq!(
            parse_broadcast_id("https://youtube.com/watch?v=2naTB5J0jfI").unwrap(),
            "2naTB5J0jfI"
        );
    }

    #[test]
    fn unrecognized_input_is_an_invalid_url() {
        for input in [
            "https://example.com/watch?v=x",
            "https://youtube.com/watch?list=only",
            "https://youtu.be/",
            "not a url at all",
        ] {
            assert!(matches!(
                parse_broadcast_id(input),
                Err(ResolverError::InvalidUrl { .. })
            ));
        }
    }

    #[test]
    fn quality_listing_skips_preamble_and_marks_best() {
        let output = concat!(
            "[youtube] extracting\n",
            "{\"formats\": [",
            "{\"format_id\": \"91\", \"resolution\": \"256x144\", \"vbr\": 269.0},",
            "{\"format_id\": \"95\", \"resolution\": \"1280x720\", \"vbr\": 2000.0},",
            "{\"format_id\": \"93\", \"resolution\": \"640x360\", \"vbr\": 800.0},",
            "{\"format_id\": \"sb0\", \"resolution\": \"storyboard\"}",
            "]}\n",
        );

        let qualities = parse_quality_listing(output).unwrap();
        assert_eq!(qualities.len(), 3);
        let best: Vec<_> = qualities.iter().filter(|q| q.best).collect();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].code, 95);
        assert_eq!(best[0].resolution, "1280x720");
    }

    #[test]
    fn best_ties_keep_the_first_seen() {
        let output = r#"{"formats": [
            {"format_id": "1", "resolution": "a", "vbr": 100.0},
            {"format_id": "2", "resolution": "b", "vbr": 100.0}
        ]}"#;

        let qualities = parse_quality_listing(output).unwrap();
        assert!(qualities[0].best);
        assert!(!qualities[1].best);
    }

    #[test]
    fn all_zero_vbr_ties_keep_the_first_seen() {
        let output = r#"{"formats": [
            {"format_id": "1", "resolution": "a", "vbr": 0.0},
            {"format_id": "2", "resolution": "b", "vbr": 0.0},
            {"format_id": "3", "resolution": "c"}
        ]}"#;

        let qualities = parse_quality_listing(output).unwrap();
        assert!(qualities[0].best);
        assert!(!qualities[1].best);
        assert!(!qualities[2].best);
    }

    #[test]
    fn empty_format_list_is_an_error() {
        assert!(matches!(
            parse_quality_listing("{\"formats\": []}"),
            Err(ResolverError::NoQualities)
        ));
    }

    #[test]
    fn not_started_markers_are_recognized() {
        assert!(marks_not_started(
            "ERROR: This live event will begin in 3 hours"
        ));
        assert!(marks_not_started("ERROR: Premieres in 20 minutes"));
        assert!(!marks_not_started("ERROR: Video unavailable"));
    }

    #[test]
    fn playlist_line_is_the_first_m3u8_line() {
        let output = "https://example.com/video.mp4\nhttps://example.com/live.m3u8\n";
        assert_eq!(
            first_playlist_line(output).as_deref(),
            Some("https://example.com/live.m3u8")
        );
        assert_eq!(first_playlist_line("no playlist here\n"), None);
    }
}
