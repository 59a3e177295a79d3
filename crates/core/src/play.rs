use serde::{Deserialize, Serialize};

/// One playable episode inside a play group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub label: String,
    pub url: String,
}

/// An ordered list of episodes contributed under one source label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayGroup {
    pub label: String,
    pub episodes: Vec<Episode>,
}

/// The catalog entry's play index: ordered play groups keyed by source label.
///
/// Groups from different sources live side by side under their own labels,
/// so a dead group from one source never displaces a living group from
/// another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayIndex {
    pub groups: Vec<PlayGroup>,
}

impl PlayIndex {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.episodes.is_empty())
    }

    pub fn episode_count(&self) -> usize {
        self.groups.iter().map(|g| g.episodes.len()).sum()
    }

    pub fn group(&self, label: &str) -> Option<&PlayGroup> {
        self.groups.iter().find(|g| g.label == label)
    }

    /// First episode URL of every group, in group order. The URL validator
    /// probes exactly these.
    pub fn first_urls(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter_map(|g| g.episodes.first().map(|e| e.url.as_str()))
            .collect()
    }

    /// Merge `incoming` into this index as a union keyed by group label.
    ///
    /// An incoming group replaces the existing group with the same label
    /// (that source's contribution is refreshed) and is appended otherwise.
    /// Commutative across distinct labels, which is what makes cross-source
    /// merge order irrelevant.
    pub fn union(&mut self, incoming: &PlayIndex) {
        for group in &incoming.groups {
            if group.episodes.is_empty() {
                continue;
            }
            match self.groups.iter_mut().find(|g| g.label == group.label) {
                Some(existing) => *existing = group.clone(),
                None => self.groups.push(group.clone()),
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"groups\":[]}".to_string())
    }

    /// Parse from the stored JSON column. Malformed rows read as empty
    /// rather than failing the query.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(label: &str, eps: &[(&str, &str)]) -> PlayGroup {
        PlayGroup {
            label: label.to_string(),
            episodes: eps
                .iter()
                .map(|(l, u)| Episode {
                    label: l.to_string(),
                    url: u.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn union_keeps_both_source_labels() {
        let mut a = PlayIndex {
            groups: vec![group("sourceX-m3u8", &[("1", "http://x/1.m3u8")])],
        };
        let b = PlayIndex {
            groups: vec![group("sourceY-m3u8", &[("1", "http://y/1.m3u8")])],
        };
        a.union(&b);
        assert_eq!(a.groups.len(), 2);
        assert!(a.group("sourceX-m3u8").is_some());
        assert!(a.group("sourceY-m3u8").is_some());
    }

    #[test]
    fn union_refreshes_same_label() {
        let mut a = PlayIndex {
            groups: vec![group("sourceX-m3u8", &[("1", "http://x/old.m3u8")])],
        };
        let b = PlayIndex {
            groups: vec![group(
                "sourceX-m3u8",
                &[("1", "http://x/new.m3u8"), ("2", "http://x/2.m3u8")],
            )],
        };
        a.union(&b);
        assert_eq!(a.groups.len(), 1);
        assert_eq!(a.group("sourceX-m3u8").unwrap().episodes.len(), 2);
        assert_eq!(
            a.group("sourceX-m3u8").unwrap().episodes[0].url,
            "http://x/new.m3u8"
        );
    }

    #[test]
    fn union_ignores_empty_groups() {
        let mut a = PlayIndex {
            groups: vec![group("live", &[("1", "http://x/1.m3u8")])],
        };
        let b = PlayIndex {
            groups: vec![group("dead", &[])],
        };
        a.union(&b);
        assert_eq!(a.groups.len(), 1);
    }

    #[test]
    fn json_round_trip_and_malformed_fallback() {
        let idx = PlayIndex {
            groups: vec![group("g", &[("1", "http://a/1")])],
        };
        let parsed = PlayIndex::from_json(&idx.to_json());
        assert_eq!(parsed, idx);
        assert!(PlayIndex::from_json("not json").is_empty());
    }
}
