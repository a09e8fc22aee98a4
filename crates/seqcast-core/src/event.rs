// ABOUTME: Defines the committed event envelope, origin keys, source events, and the watermark cursor.
// ABOUTME: Payloads are a closed set of game-ledger kinds carried inside a common envelope.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source-assigned total-order key: the block an event was emitted in and
/// its position within that block. Ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OriginKey {
    pub block: u64,
    pub index: u32,
}

impl OriginKey {
    pub fn new(block: u64, index: u32) -> Self {
        Self { block, index }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.index)
    }
}

/// An origin key together with the source's identity digest for it (for
/// example the block hash). Two origins with the same key but different
/// hashes describe divergent histories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub key: OriginKey,
    pub hash: String,
}

impl Origin {
    pub fn new(block: u64, index: u32, hash: impl Into<String>) -> Self {
        Self {
            key: OriginKey::new(block, index),
            hash: hash.into(),
        }
    }
}

/// A committed, sequenced event. Immutable once written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sequence_id: u64,
    pub origin: Origin,
    pub committed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// The closed set of things the game ledger reports. Serialized as
/// `{"kind": "...", "fields": {...}}` so the envelope stays uniform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "fields",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    PlayerRegistered {
        player: String,
        display_name: String,
    },
    ProfileUpdated {
        player: String,
        display_name: Option<String>,
        avatar_uri: Option<String>,
    },
    CrewCreated {
        crew_id: u64,
        name: String,
        captain: String,
    },
    CrewMemberJoined {
        crew_id: u64,
        player: String,
    },
    CrewMemberLeft {
        crew_id: u64,
        player: String,
    },
    ScoreRecorded {
        player: String,
        season: u32,
        points: i64,
    },
    SeasonSettled {
        season: u32,
        winners: Vec<String>,
    },
}

impl EventPayload {
    /// The serde tag for this variant, also stored in the log's `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::PlayerRegistered { .. } => "player_registered",
            EventPayload::ProfileUpdated { .. } => "profile_updated",
            EventPayload::CrewCreated { .. } => "crew_created",
            EventPayload::CrewMemberJoined { .. } => "crew_member_joined",
            EventPayload::CrewMemberLeft { .. } => "crew_member_left",
            EventPayload::ScoreRecorded { .. } => "score_recorded",
            EventPayload::SeasonSettled { .. } => "season_settled",
        }
    }
}

/// An event as emitted by the upstream source, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub origin: Origin,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SourceEvent {
    pub fn new(origin: Origin, payload: EventPayload) -> Self {
        Self { origin, payload }
    }

    /// Stamp this source event with its assigned sequence id and commit time.
    pub fn into_event(self, sequence_id: u64, committed_at: DateTime<Utc>) -> Event {
        Event {
            sequence_id,
            origin: self.origin,
            committed_at,
            payload: self.payload,
        }
    }
}

/// Durable ingestion progress cursor, persisted in the same transaction as
/// every commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub last_assigned_sequence_id: u64,
    pub last_origin: Option<Origin>,
}

impl Watermark {
    pub fn last_origin_key(&self) -> Option<OriginKey> {
        self.last_origin.as_ref().map(|o| o.key)
    }

    /// True when `key` is at or behind the cursor, i.e. it was already
    /// processed or it moves the order backward.
    pub fn covers(&self, key: OriginKey) -> bool {
        self.last_origin_key().is_some_and(|last| key <= last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(points: i64) -> EventPayload {
        EventPayload::ScoreRecorded {
            player: "0xabc".to_string(),
            season: 3,
            points,
        }
    }

    #[test]
    fn origin_keys_order_by_block_then_index() {
        let a = OriginKey::new(10, 5);
        let b = OriginKey::new(10, 6);
        let c = OriginKey::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.to_string(), "11:0");
    }

    #[test]
    fn event_envelope_uses_kind_and_fields() {
        let event = SourceEvent::new(Origin::new(7, 1, "0xhash"), score(42))
            .into_event(9, Utc::now());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequenceId"], 9);
        assert_eq!(json["kind"], "score_recorded");
        assert_eq!(json["fields"]["points"], 42);
        assert_eq!(json["origin"]["key"]["block"], 7);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let payload = EventPayload::CrewMemberJoined {
            crew_id: 4,
            player: "0xdef".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], payload.kind());
        assert_eq!(json["fields"]["crewId"], 4);
    }

    #[test]
    fn watermark_covers_keys_at_or_behind() {
        let empty = Watermark::default();
        assert!(!empty.covers(OriginKey::new(0, 0)));

        let wm = Watermark {
            last_assigned_sequence_id: 3,
            last_origin: Some(Origin::new(100, 2, "h")),
        };
        assert!(wm.covers(OriginKey::new(100, 2)));
        assert!(wm.covers(OriginKey::new(99, 9)));
        assert!(!wm.covers(OriginKey::new(100, 3)));
    }

    #[test]
    fn source_event_parses_from_jsonl_line() {
        let line = r#"{"origin":{"key":{"block":5,"index":0},"hash":"0x01"},"kind":"player_registered","fields":{"player":"0xaa","displayName":"ace"}}"#;
        let ev: SourceEvent = serde_json::from_str(line).unwrap();
        assert_eq!(ev.origin.key, OriginKey::new(5, 0));
        assert!(matches!(ev.payload, EventPayload::PlayerRegistered { .. }));
    }

    #[test]
    fn score_line_parses_and_pascal_case_kind_is_rejected() {
        let line = r#"{"origin":{"key":{"block":1,"index":0},"hash":"0xabc"},"kind":"score_recorded","fields":{"player":"0xfeed","season":1,"points":42}}"#;
        let ev: SourceEvent = serde_json::from_str(line).unwrap();
        let expected = SourceEvent::new(
            Origin::new(1, 0, "0xabc"),
            EventPayload::ScoreRecorded {
                player: "0xfeed".to_string(),
                season: 1,
                points: 42,
            },
        );
        assert_eq!(ev, expected);

        let pascal = line.replace("score_recorded", "ScoreRecorded");
        assert!(serde_json::from_str::<SourceEvent>(&pascal).is_err());
    }
}
