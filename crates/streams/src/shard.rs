use std::collections::BTreeMap;

/// The contiguous token range owned by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HashRange {
    pub start: i64,
    pub end: i64,
}

/// One logical partition of a table's CDC stream. Shards appear when the
/// stream opens or resplits, and terminate at an end-of-shard marker after
/// which their children must be drained.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Shard {
    pub shard_id: String,
    #[serde(default)]
    pub parent_shard_ids: Vec<String>,
    pub hash_range: HashRange,
}

impl Shard {
    /// Child shards per parent, derived from an enumeration.
    pub fn children_by_parent(shards: &[Shard]) -> BTreeMap<&str, Vec<&str>> {
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for shard in shards {
            for parent in &shard.parent_shard_ids {
                children
                    .entry(parent.as_str())
                    .or_default()
                    .push(shard.shard_id.as_str());
            }
        }
        children
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn shard(id: &str, parents: &[&str]) -> Shard {
        Shard {
            shard_id: id.to_string(),
            parent_shard_ids: parents.iter().map(|p| p.to_string()).collect(),
            hash_range: HashRange {
                start: i64::MIN,
                end: i64::MAX,
            },
        }
    }

    #[test]
    fn children_are_grouped_by_parent() {
        let shards = vec![shard("p", &[]), shard("c1", &["p"]), shard("c2", &["p"])];
        let children = Shard::children_by_parent(&shards);
        assert_eq!(children.get("p"), Some(&vec!["c1", "c2"]));
        assert_eq!(children.get("c1"), None);
    }
}
