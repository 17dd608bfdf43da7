use crate::{CellValue, Result, TypedCell};
use std::collections::BTreeMap;

/// An opaque, ordered position token. Sequence numbers are comparable only
/// within a shard, by lexicographic byte order.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub String);

impl SequenceNumber {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceNumber {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A durable position within one shard. `TrimHorizon` precedes any record
/// and `ShardEnd` follows every record of the shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    TrimHorizon,
    Sequence(SequenceNumber),
    ShardEnd,
}

impl Checkpoint {
    pub const TRIM_HORIZON_TOKEN: &'static str = "TRIM_HORIZON";
    pub const SHARD_END_TOKEN: &'static str = "SHARD_END";

    pub fn sequence(s: impl Into<String>) -> Self {
        Self::Sequence(SequenceNumber::new(s))
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, Self::ShardEnd)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::TrimHorizon => 0,
            Self::Sequence(_) => 1,
            Self::ShardEnd => 2,
        }
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Self::Sequence(a), Self::Sequence(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrimHorizon => f.write_str(Self::TRIM_HORIZON_TOKEN),
            Self::Sequence(seq) => f.write_str(seq.as_str()),
            Self::ShardEnd => f.write_str(Self::SHARD_END_TOKEN),
        }
    }
}

impl std::str::FromStr for Checkpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            Self::TRIM_HORIZON_TOKEN => Self::TrimHorizon,
            Self::SHARD_END_TOKEN => Self::ShardEnd,
            other => Self::Sequence(SequenceNumber::new(other)),
        })
    }
}

impl serde::Serialize for Checkpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Checkpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(s.parse().unwrap())
    }
}

/// Why a change event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    User,
    Replication,
    Ttl,
}

/// The classified operation of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Ttl,
    ReplicatedInsert,
    ReplicatedUpdate,
    ReplicatedDelete,
}

impl OperationType {
    /// Classify from the record's origin and image presence. `None` marks
    /// the UNKNOWN case, which callers reject (logged, counted, skipped).
    pub fn classify(origin: Origin, has_new: bool, has_old: bool) -> Option<Self> {
        match (origin, has_new, has_old) {
            (_, false, false) => None,
            (Origin::Ttl, _, _) => Some(Self::Ttl),
            (Origin::User, true, false) => Some(Self::Insert),
            (Origin::User, false, true) => Some(Self::Delete),
            (Origin::User, true, true) => Some(Self::Update),
            (Origin::Replication, true, false) => Some(Self::ReplicatedInsert),
            (Origin::Replication, false, true) => Some(Self::ReplicatedDelete),
            (Origin::Replication, true, true) => Some(Self::ReplicatedUpdate),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ttl => "TTL",
            Self::ReplicatedInsert => "REPLICATED_INSERT",
            Self::ReplicatedUpdate => "REPLICATED_UPDATE",
            Self::ReplicatedDelete => "REPLICATED_DELETE",
        }
    }

    /// Operations that carry their row state in `new_image`.
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::ReplicatedInsert | Self::ReplicatedUpdate
        )
    }

    /// Operations that identify the removed row through `old_image`.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete | Self::Ttl | Self::ReplicatedDelete)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw change event as yielded by the shard iterator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamRecord {
    pub sequence_number: SequenceNumber,
    /// Approximate arrival time, epoch milliseconds.
    pub arrival_time: i64,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<BTreeMap<String, TypedCell>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<BTreeMap<String, TypedCell>>,
}

/// A decoded change event: native cell values plus the classified operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub sequence_number: SequenceNumber,
    /// Approximate arrival time, epoch milliseconds.
    pub arrival_time: i64,
    pub operation: OperationType,
    pub new_image: Option<BTreeMap<String, CellValue>>,
    pub old_image: Option<BTreeMap<String, CellValue>>,
}

impl ChangeRecord {
    /// Decode a raw record. `Ok(None)` marks an UNKNOWN operation, which the
    /// processor skips and counts; cell decode failures are surfaced.
    pub fn decode(raw: &StreamRecord) -> Result<Option<Self>> {
        let operation = match OperationType::classify(
            raw.origin,
            raw.new_image.is_some(),
            raw.old_image.is_some(),
        ) {
            Some(op) => op,
            None => return Ok(None),
        };

        let decode_image = |image: &Option<BTreeMap<String, TypedCell>>| -> Result<_> {
            image
                .as_ref()
                .map(|cells| {
                    cells
                        .iter()
                        .map(|(name, cell)| Ok((name.clone(), CellValue::decode(cell)?)))
                        .collect::<Result<BTreeMap<_, _>>>()
                })
                .transpose()
        };

        Ok(Some(Self {
            sequence_number: raw.sequence_number.clone(),
            arrival_time: raw.arrival_time,
            operation,
            new_image: decode_image(&raw.new_image)?,
            old_image: decode_image(&raw.old_image)?,
        }))
    }

    /// The image carrying this record's row state: `new_image` for upserts,
    /// `old_image` for deletes and TTL expiry.
    pub fn state_image(&self) -> Option<&BTreeMap<String, CellValue>> {
        if self.operation.is_delete() {
            self.old_image.as_ref()
        } else {
            self.new_image.as_ref()
        }
    }

    /// Project an image into a JSON object.
    pub fn image_to_json(image: &BTreeMap<String, CellValue>) -> serde_json::Value {
        serde_json::Value::Object(
            image
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}
