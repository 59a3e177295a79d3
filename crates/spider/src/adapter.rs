//! Per-source-family payload adapters.
//!
//! Upstream sites disagree on field names (`vod_name` vs `name`, …), so
//! each source family gets one adapter that maps its raw payload to the
//! canonical pre-merge record. Field-sniffing stays here and nowhere else.

use serde_json::Value;
use tracing::debug;

use crate::play::parse_play_blob;
use crate::{CanonicalRecord, ListItem};

/// Query parameters for one request against a source's base endpoint.
/// The HTTP client appends and percent-encodes them.
pub type QueryParams = Vec<(&'static str, String)>;

/// Maps one source family's raw payloads to canonical records. Pure
/// functions; the [`crate::client::SpiderClient`] does the I/O.
pub trait SourceAdapter: Send + Sync {
    fn family(&self) -> &str;

    fn list_params(&self, page: u32, category: Option<&str>) -> QueryParams;

    fn detail_params(&self, ids: &[String]) -> QueryParams;

    fn search_params(&self, keyword: &str) -> QueryParams;

    /// Extract list items from a list-page body. Malformed entries are
    /// dropped, never errors.
    fn parse_list(&self, body: &Value) -> Vec<ListItem>;

    /// Extract full canonical records from a detail body.
    fn parse_detail(&self, source_id: &str, body: &Value) -> Vec<CanonicalRecord>;
}

/// Adapter for the dominant resource-site family: query-string paged list
/// (`ac=list&pg=N`) and batched detail (`ac=detail&ids=1,2`), JSON bodies
/// with `vod_`-prefixed fields and delimited play blobs.
#[derive(Debug, Default)]
pub struct MacCmsAdapter;

impl SourceAdapter for MacCmsAdapter {
    fn family(&self) -> &str {
        "maccms"
    }

    fn list_params(&self, page: u32, category: Option<&str>) -> QueryParams {
        let mut params = vec![("ac", "list".to_string()), ("pg", page.to_string())];
        if let Some(cat) = category {
            params.push(("t", cat.to_string()));
        }
        params
    }

    fn detail_params(&self, ids: &[String]) -> QueryParams {
        vec![("ac", "detail".to_string()), ("ids", ids.join(","))]
    }

    fn search_params(&self, keyword: &str) -> QueryParams {
        vec![("ac", "list".to_string()), ("wd", keyword.to_string())]
    }

    fn parse_list(&self, body: &Value) -> Vec<ListItem> {
        let items = body["list"].as_array().cloned().unwrap_or_default();
        items
            .iter()
            .filter_map(|item| {
                let id = pick_id(item)?;
                let title = pick_str(item, &["vod_name", "name", "title"])?;
                Some(ListItem {
                    source_item_id: id,
                    title,
                    category: pick_str(item, &["type_name", "type", "category"])
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    fn parse_detail(&self, source_id: &str, body: &Value) -> Vec<CanonicalRecord> {
        let items = body["list"].as_array().cloned().unwrap_or_default();
        items
            .iter()
            .filter_map(|item| {
                let title = match pick_str(item, &["vod_name", "name", "title"]) {
                    Some(t) => t,
                    None => {
                        debug!("detail item missing title, dropping");
                        return None;
                    }
                };

                let play_from = pick_str(item, &["vod_play_from", "play_from"]).unwrap_or_default();
                let play_url = pick_str(item, &["vod_play_url", "play_url"]).unwrap_or_default();

                Some(CanonicalRecord {
                    source_id: source_id.to_string(),
                    title,
                    category: pick_str(item, &["type_name", "type", "category"])
                        .unwrap_or_default(),
                    year: pick_year(item),
                    region: pick_str(item, &["vod_area", "area", "region"]),
                    genres: pick_str(item, &["vod_class", "class", "genre"])
                        .map(|s| split_list(&s))
                        .unwrap_or_default(),
                    cast: pick_str(item, &["vod_actor", "actor", "cast"])
                        .map(|s| split_list(&s))
                        .unwrap_or_default(),
                    synopsis: pick_str(item, &["vod_content", "content", "blurb", "synopsis"])
                        .map(|s| strip_tags(&s)),
                    remark: pick_str(item, &["vod_remarks", "remarks", "note"]),
                    rating: pick_rating(item),
                    play_index: parse_play_blob(&play_from, &play_url),
                })
            })
            .collect()
    }
}

/// First non-empty string among the given field-name synonyms.
fn pick_str(item: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match &item[*key] {
            Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Value::Number(n) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Source-assigned item id, numeric or string.
fn pick_id(item: &Value) -> Option<String> {
    for key in ["vod_id", "id"] {
        match &item[key] {
            Value::Number(n) => return Some(n.to_string()),
            Value::String(s) if !s.is_empty() => return Some(s.clone()),
            _ => {}
        }
    }
    None
}

fn pick_year(item: &Value) -> Option<i64> {
    pick_str(item, &["vod_year", "year"])
        .and_then(|s| s.get(..4).map(str::to_string))
        .and_then(|s| s.parse().ok())
        .filter(|y| (1900..=2100).contains(y))
}

fn pick_rating(item: &Value) -> f64 {
    for key in ["vod_score", "score", "rating", "vod_douban_score"] {
        match &item[key] {
            Value::Number(n) => return n.as_f64().unwrap_or(0.0),
            Value::String(s) => {
                if let Ok(v) = s.trim().parse::<f64>() {
                    return v;
                }
            }
            _ => {}
        }
    }
    0.0
}

/// Split an upstream name list on the separators sites actually use.
fn split_list(s: &str) -> Vec<String> {
    s.split([',', '/', '，', '、'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Synopses frequently arrive wrapped in markup; keep the text only.
fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_params_include_page_and_category() {
        let a = MacCmsAdapter;
        assert_eq!(
            a.list_params(3, None),
            vec![("ac", "list".to_string()), ("pg", "3".to_string())]
        );
        assert_eq!(
            a.list_params(1, Some("movie")),
            vec![
                ("ac", "list".to_string()),
                ("pg", "1".to_string()),
                ("t", "movie".to_string()),
            ]
        );
    }

    #[test]
    fn search_params_carry_the_keyword_verbatim() {
        // Percent-encoding happens in the HTTP client; CJK keywords pass
        // through here untouched.
        let a = MacCmsAdapter;
        assert_eq!(
            a.search_params("示例 A"),
            vec![("ac", "list".to_string()), ("wd", "示例 A".to_string())]
        );
    }

    #[test]
    fn detail_params_join_ids() {
        let a = MacCmsAdapter;
        assert_eq!(
            a.detail_params(&["101".to_string(), "102".to_string()]),
            vec![("ac", "detail".to_string()), ("ids", "101,102".to_string())]
        );
    }

    #[test]
    fn parse_list_tolerates_field_synonyms() {
        let a = MacCmsAdapter;
        let body = json!({
            "code": 1,
            "list": [
                { "vod_id": 101, "vod_name": "示例电影", "type_name": "movie" },
                { "id": "abc", "name": "Other Film", "type": "movie" },
                { "vod_id": 103 }
            ]
        });
        let items = a.parse_list(&body);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_item_id, "101");
        assert_eq!(items[0].title, "示例电影");
        assert_eq!(items[1].source_item_id, "abc");
    }

    #[test]
    fn parse_detail_builds_canonical_record() {
        let a = MacCmsAdapter;
        let body = json!({
            "list": [{
                "vod_id": 101,
                "vod_name": "示例电影",
                "type_name": "movie",
                "vod_year": "2023",
                "vod_area": "大陆",
                "vod_class": "剧情,动作",
                "vod_actor": "张三,李四",
                "vod_content": "<p>一部示例影片。</p>",
                "vod_remarks": "更新至第8集",
                "vod_score": "7.9",
                "vod_play_from": "m3u8",
                "vod_play_url": "第01集$https://cdn.example/1.m3u8#第02集$https://cdn.example/2.m3u8"
            }]
        });
        let recs = a.parse_detail("src-1", &body);
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert_eq!(r.title, "示例电影");
        assert_eq!(r.year, Some(2023));
        assert_eq!(r.genres, vec!["剧情", "动作"]);
        assert_eq!(r.cast, vec!["张三", "李四"]);
        assert_eq!(r.synopsis.as_deref(), Some("一部示例影片。"));
        assert!((r.rating - 7.9).abs() < f64::EPSILON);
        assert_eq!(r.play_index.groups.len(), 1);
        assert_eq!(r.play_index.episode_count(), 2);
    }

    #[test]
    fn parse_detail_drops_untitled_items() {
        let a = MacCmsAdapter;
        let body = json!({ "list": [{ "vod_id": 1, "vod_year": "2020" }] });
        assert!(a.parse_detail("s", &body).is_empty());
    }

    #[test]
    fn year_outside_plausible_range_is_dropped() {
        let a = MacCmsAdapter;
        let body = json!({
            "list": [{ "vod_id": 1, "vod_name": "X", "vod_year": "0" }]
        });
        let recs = a.parse_detail("s", &body);
        assert_eq!(recs[0].year, None);
    }
}
