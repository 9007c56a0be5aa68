// ── Upstream → domain conversion ──
//
// Turns raw feed frames into typed `Event`s. Known `type` tags decode
// into their `EventPayload` variant; anything else (or a known tag with
// a body that doesn't fit) is kept as `Raw`.

use fanout_api::FeedEvent;
use serde_json::Value;
use tracing::trace;

use crate::model::{Event, EventPayload, ImpactAssessment, Priority, TopicId};

/// Source of injury-impact annotations. The model behind it lives
/// outside the engine.
pub trait ImpactAssessor: Send + Sync {
    /// Assess a report about `player_id` with upstream `status`.
    /// `None` leaves the event unannotated.
    fn assess(&self, player_id: &str, status: &str) -> Option<ImpactAssessment>;
}

/// Tags produced by the engine itself; upstream frames can't forge them.
const INTERNAL_TYPES: &[&str] = &["gap", "connection_status", "consensus_shift"];

pub fn payload_from_feed(event_type: &str, payload: &Value) -> EventPayload {
    let raw = || EventPayload::Raw {
        event_type: event_type.to_owned(),
        data: payload.clone(),
    };

    if INTERNAL_TYPES.contains(&event_type) {
        return raw();
    }
    let Value::Object(fields) = payload else {
        return raw();
    };

    let mut tagged = fields.clone();
    tagged.insert("type".into(), Value::String(event_type.to_owned()));
    match serde_json::from_value::<EventPayload>(Value::Object(tagged)) {
        Ok(EventPayload::Raw { .. }) | Err(_) => {
            trace!(event_type, "unmodelled payload kept raw");
            raw()
        }
        Ok(typed) => typed,
    }
}

/// Build the routed event for one feed frame.
///
/// A `priority` field in the payload overrides the kind's default.
/// Injury reports without an impact are annotated by `assessor` when one
/// is given.
pub fn event_from_feed(feed: &FeedEvent, assessor: Option<&dyn ImpactAssessor>) -> Event {
    let mut payload = payload_from_feed(&feed.event_type, &feed.payload);

    if let (
        Some(assessor),
        EventPayload::InjuryReport {
            player_id,
            status,
            impact: impact @ None,
        },
    ) = (assessor, &mut payload)
    {
        *impact = assessor.assess(player_id, status);
    }

    let mut event = Event::new(feed.channel.clone(), payload);
    if let Some(entity) = &feed.entity_id {
        event = event.with_entity(entity.clone());
    }
    if let Some(priority) = feed
        .payload
        .get("priority")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<Priority>().ok())
    {
        event = event.with_priority(priority);
    }
    event
}

/// Channel that carries shift events for a consensus topic.
pub fn consensus_channel(topic: &TopicId) -> String {
    format!("consensus:{topic}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(event_type: &str, payload: Value) -> FeedEvent {
        serde_json::from_value(json!({
            "type": event_type,
            "channel": "game:42",
            "entityId": "42",
            "payload": payload,
        }))
        .unwrap()
    }

    struct FixedImpact;

    impl ImpactAssessor for FixedImpact {
        fn assess(&self, _player_id: &str, status: &str) -> Option<ImpactAssessment> {
            (status == "out").then(|| ImpactAssessment {
                score: 0.8,
                affected_topics: vec!["match-42".into()],
            })
        }
    }

    #[test]
    fn known_type_decodes() {
        let event = event_from_feed(&feed("score_update", json!({ "home": 2, "away": 1 })), None);
        assert_eq!(
            *event.payload(),
            EventPayload::ScoreUpdate {
                home: 2,
                away: 1,
                period: None
            }
        );
        assert_eq!(event.channel(), "game:42");
        assert_eq!(event.entity_id(), Some("42"));
        assert_eq!(event.priority(), Priority::Normal);
    }

    #[test]
    fn unknown_or_mismatched_types_stay_raw() {
        let event = event_from_feed(&feed("weather", json!({ "temp": 4 })), None);
        assert_eq!(event.payload().type_name(), "weather");

        let event = event_from_feed(&feed("score_update", json!({ "home": "two" })), None);
        assert!(matches!(event.payload(), EventPayload::Raw { .. }));

        let event = event_from_feed(&feed("odds_update", json!([1, 2])), None);
        assert!(matches!(event.payload(), EventPayload::Raw { .. }));
    }

    #[test]
    fn upstream_cannot_forge_internal_types() {
        let event = event_from_feed(&feed("gap", json!({ "missed": 3 })), None);
        assert!(!event.is_gap());
    }

    #[test]
    fn payload_priority_overrides_default() {
        let event = event_from_feed(
            &feed("game_state", json!({ "status": "final", "priority": "critical" })),
            None,
        );
        assert_eq!(event.priority(), Priority::Critical);
    }

    #[test]
    fn injury_reports_are_annotated() {
        let frame = feed("injury_report", json!({ "player_id": "p9", "status": "out" }));
        let event = event_from_feed(&frame, Some(&FixedImpact));
        match event.payload() {
            EventPayload::InjuryReport { impact: Some(impact), .. } => {
                assert_eq!(impact.affected_topics, vec![TopicId::from("match-42")]);
            }
            other => panic!("expected annotated injury report, got {other:?}"),
        }

        let unannotated = event_from_feed(&frame, None);
        assert!(matches!(
            unannotated.payload(),
            EventPayload::InjuryReport { impact: None, .. }
        ));
    }
}
