//! Parser for the delimited play-URL packing used by resource sites.
//!
//! The legacy wire format packs every play group and episode into two
//! parallel strings: group labels split on `$$$`, and for each group an
//! episode list split on `#`, each episode `label$url`. Parsed defensively
//! at this boundary into the typed [`PlayIndex`]; the delimited form never
//! propagates further.

use vodsync_core::play::{Episode, PlayGroup, PlayIndex};

const GROUP_SEP: &str = "$$$";
const EPISODE_SEP: char = '#';
const LABEL_SEP: char = '$';

/// Parse `play_from` / `play_url` blobs into a play index.
///
/// Malformed or empty segments are dropped silently; partial parses are
/// expected from flaky sources. A group without a label gets a positional
/// one so its episodes are not lost.
pub fn parse_play_blob(play_from: &str, play_url: &str) -> PlayIndex {
    let labels: Vec<&str> = play_from.split(GROUP_SEP).map(str::trim).collect();
    let mut groups = Vec::new();

    for (i, blob) in play_url.split(GROUP_SEP).enumerate() {
        let episodes = parse_group(blob);
        if episodes.is_empty() {
            continue;
        }
        let label = labels
            .get(i)
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .unwrap_or_else(|| format!("group{}", i + 1));
        groups.push(PlayGroup { label, episodes });
    }

    PlayIndex { groups }
}

fn parse_group(blob: &str) -> Vec<Episode> {
    let mut episodes = Vec::new();
    for (i, seg) in blob.split(EPISODE_SEP).enumerate() {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        match seg.split_once(LABEL_SEP) {
            Some((label, url)) => {
                let url = url.trim();
                if url.is_empty() || !is_playable_url(url) {
                    continue;
                }
                let label = if label.trim().is_empty() {
                    (i + 1).to_string()
                } else {
                    label.trim().to_string()
                };
                episodes.push(Episode {
                    label,
                    url: url.to_string(),
                });
            }
            // Bare URL segment with no episode label.
            None if is_playable_url(seg) => episodes.push(Episode {
                label: (i + 1).to_string(),
                url: seg.to_string(),
            }),
            None => {}
        }
    }
    episodes
}

fn is_playable_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_groups_with_episodes() {
        let idx = parse_play_blob(
            "m3u8$$$mp4",
            "第01集$https://a/1.m3u8#第02集$https://a/2.m3u8$$$1$https://b/1.mp4",
        );
        assert_eq!(idx.groups.len(), 2);
        assert_eq!(idx.groups[0].label, "m3u8");
        assert_eq!(idx.groups[0].episodes.len(), 2);
        assert_eq!(idx.groups[0].episodes[1].label, "第02集");
        assert_eq!(idx.groups[1].episodes[0].url, "https://b/1.mp4");
    }

    #[test]
    fn drops_malformed_segments_silently() {
        let idx = parse_play_blob(
            "m3u8",
            "ep1$https://a/1.m3u8#garbage#ep3$#$https://a/4.m3u8#ep5$ftp://nope",
        );
        assert_eq!(idx.groups.len(), 1);
        let eps = &idx.groups[0].episodes;
        // ep1 kept, bare-label "4" kept (empty label before '$'), rest dropped.
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].label, "ep1");
        assert_eq!(eps[1].label, "4");
        assert_eq!(eps[1].url, "https://a/4.m3u8");
    }

    #[test]
    fn bare_url_segment_gets_positional_label() {
        let idx = parse_play_blob("", "https://a/only.m3u8");
        assert_eq!(idx.groups.len(), 1);
        assert_eq!(idx.groups[0].label, "group1");
        assert_eq!(idx.groups[0].episodes[0].label, "1");
    }

    #[test]
    fn empty_groups_are_dropped() {
        let idx = parse_play_blob("a$$$b$$$c", "$$$ep$https://x/1.m3u8$$$");
        assert_eq!(idx.groups.len(), 1);
        assert_eq!(idx.groups[0].label, "b");
    }

    #[test]
    fn empty_blob_is_not_an_error() {
        assert!(parse_play_blob("", "").is_empty());
    }

    #[test]
    fn missing_label_falls_back_to_position() {
        let idx = parse_play_blob("$$$mp4", "ep$https://a/1#ep2$https://a/2$$$x$https://b/1");
        assert_eq!(idx.groups[0].label, "group1");
        assert_eq!(idx.groups[1].label, "mp4");
    }
}
