use streams::{Origin, StreamRecord, TypedCell};
use std::collections::BTreeMap;

/// A wire image from `(column, tag, value)` triples.
pub fn image(cells: &[(&str, &str, serde_json::Value)]) -> BTreeMap<String, TypedCell> {
    cells
        .iter()
        .map(|(name, tag, value)| (name.to_string(), TypedCell::new(*tag, value.clone())))
        .collect()
}

pub fn insert(seq: &str, arrival: i64, cells: &[(&str, &str, serde_json::Value)]) -> StreamRecord {
    StreamRecord {
        sequence_number: seq.into(),
        arrival_time: arrival,
        origin: Origin::User,
        new_image: Some(image(cells)),
        old_image: None,
    }
}

pub fn update(
    seq: &str,
    arrival: i64,
    new: &[(&str, &str, serde_json::Value)],
    old: &[(&str, &str, serde_json::Value)],
) -> StreamRecord {
    StreamRecord {
        sequence_number: seq.into(),
        arrival_time: arrival,
        origin: Origin::User,
        new_image: Some(image(new)),
        old_image: Some(image(old)),
    }
}

pub fn delete(seq: &str, arrival: i64, cells: &[(&str, &str, serde_json::Value)]) -> StreamRecord {
    StreamRecord {
        sequence_number: seq.into(),
        arrival_time: arrival,
        origin: Origin::User,
        new_image: None,
        old_image: Some(image(cells)),
    }
}

pub fn ttl_expiry(
    seq: &str,
    arrival: i64,
    cells: &[(&str, &str, serde_json::Value)],
) -> StreamRecord {
    StreamRecord {
        sequence_number: seq.into(),
        arrival_time: arrival,
        origin: Origin::Ttl,
        new_image: None,
        old_image: Some(image(cells)),
    }
}

/// A record with no image at all; classifies as UNKNOWN and is rejected.
pub fn imageless(seq: &str) -> StreamRecord {
    StreamRecord {
        sequence_number: seq.into(),
        arrival_time: 0,
        origin: Origin::User,
        new_image: None,
        old_image: None,
    }
}
