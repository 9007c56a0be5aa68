// ── Consensus aggregator ──
//
// Running aggregate per topic: choice distribution, participant set and
// mean confidence. A shift is reported when the majority changes or the
// mean moves by at least the threshold since the last reported snapshot.

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::model::{ConsensusShift, RecipientId, TopicId};

/// Mean-confidence movement, in percentage points, that counts as a
/// material shift on its own. Overridable through `EngineConfig`.
pub const DEFAULT_SHIFT_THRESHOLD: f64 = 10.0;

/// Aggregate view of a topic after a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusSnapshot {
    pub topic: TopicId,
    pub majority: Option<String>,
    pub mean_confidence: f64,
    /// Submissions counted so far.
    pub submissions: u64,
    /// Choice → count, in the order choices first appeared.
    pub distribution: IndexMap<String, u64>,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub snapshot: ConsensusSnapshot,
    pub shift: Option<ConsensusShift>,
}

#[derive(Debug, Default)]
struct TopicState {
    distribution: IndexMap<String, u64>,
    participants: IndexSet<RecipientId>,
    submissions: u64,
    mean: f64,
    /// Majority and mean as of the last reported snapshot.
    emitted: Option<(String, f64)>,
    closed: bool,
}

impl TopicState {
    /// Highest count wins; on a tie the choice seen first wins.
    fn majority(&self) -> Option<&String> {
        let mut best: Option<(&String, u64)> = None;
        for (choice, &count) in &self.distribution {
            if best.is_none_or(|(_, top)| count > top) {
                best = Some((choice, count));
            }
        }
        best.map(|(choice, _)| choice)
    }

    fn snapshot(&self, topic: &TopicId) -> ConsensusSnapshot {
        ConsensusSnapshot {
            topic: topic.clone(),
            majority: self.majority().cloned(),
            mean_confidence: self.mean,
            submissions: self.submissions,
            distribution: self.distribution.clone(),
            closed: self.closed,
        }
    }
}

#[derive(Debug)]
pub struct ConsensusAggregator {
    topics: DashMap<TopicId, TopicState>,
    threshold: f64,
}

impl Default for ConsensusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SHIFT_THRESHOLD)
    }
}

impl ConsensusAggregator {
    pub fn new(threshold: f64) -> Self {
        Self {
            topics: DashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Fold one `(choice, confidence)` submission into the topic.
    ///
    /// The first submission on a topic sets the baseline and never
    /// reports a shift.
    pub fn submit(
        &self,
        topic: &TopicId,
        recipient: &RecipientId,
        choice: &str,
        confidence: f64,
    ) -> Result<SubmitOutcome, CoreError> {
        if topic.as_str().is_empty() {
            return Err(CoreError::validation("topic id must not be empty"));
        }
        if choice.trim().is_empty() {
            return Err(CoreError::validation("choice must not be empty"));
        }
        if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
            return Err(CoreError::validation(format!(
                "confidence must be within 0..=100, got {confidence}"
            )));
        }

        let mut state = self.topics.entry(topic.clone()).or_default();
        if state.closed {
            return Err(CoreError::validation(format!("topic {topic} is closed")));
        }

        *state.distribution.entry(choice.to_owned()).or_insert(0) += 1;
        state.participants.insert(recipient.clone());
        state.submissions += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = state.submissions as f64;
        state.mean += (confidence - state.mean) / n;

        let majority = state.majority().cloned().unwrap_or_default();
        let mean = state.mean;
        let shift = match state.emitted.take() {
            None => {
                debug!(topic = %topic, majority = %majority, mean, "consensus baseline");
                state.emitted = Some((majority, mean));
                None
            }
            Some((prev_majority, prev_mean)) => {
                let moved = (mean - prev_mean).abs() >= self.threshold;
                if prev_majority != majority || moved {
                    #[allow(clippy::cast_possible_truncation)]
                    let participants = state.participants.len() as u64;
                    let shift = ConsensusShift {
                        topic: topic.clone(),
                        previous_majority: Some(prev_majority),
                        majority: majority.clone(),
                        previous_mean_confidence: prev_mean,
                        mean_confidence: mean,
                        participants,
                    };
                    info!(
                        topic = %topic,
                        majority = %majority,
                        mean,
                        previous_mean = prev_mean,
                        "consensus shifted"
                    );
                    state.emitted = Some((majority, mean));
                    Some(shift)
                } else {
                    state.emitted = Some((prev_majority, prev_mean));
                    None
                }
            }
        };

        Ok(SubmitOutcome {
            snapshot: state.snapshot(topic),
            shift,
        })
    }

    pub fn snapshot(&self, topic: &TopicId) -> Option<ConsensusSnapshot> {
        self.topics.get(topic).map(|s| s.snapshot(topic))
    }

    /// Recipients who have submitted on `topic`, in first-submission order.
    pub fn participants(&self, topic: &TopicId) -> Vec<RecipientId> {
        self.topics
            .get(topic)
            .map(|s| s.participants.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop accepting submissions. Returns the final snapshot.
    pub fn close_topic(&self, topic: &TopicId) -> Result<ConsensusSnapshot, CoreError> {
        let mut state = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| CoreError::not_found("Topic", topic))?;
        state.closed = true;
        Ok(state.snapshot(topic))
    }

    /// Forget a topic entirely.
    pub fn remove_topic(&self, topic: &TopicId) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn topics(&self) -> Vec<TopicId> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn submit_all(agg: &ConsensusAggregator, topic: &TopicId, votes: &[(&str, f64)]) -> Vec<SubmitOutcome> {
        votes
            .iter()
            .enumerate()
            .map(|(i, (choice, conf))| {
                let who = RecipientId::new(format!("user-{i}"));
                agg.submit(topic, &who, choice, *conf).unwrap()
            })
            .collect()
    }

    #[test]
    fn five_votes_then_tie_keeps_earliest_choice() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("match-1");
        let outcomes = submit_all(
            &agg,
            &topic,
            &[("A", 80.0), ("A", 70.0), ("B", 90.0), ("A", 60.0), ("B", 75.0)],
        );
        let last = &outcomes[4].snapshot;
        assert_eq!(last.majority.as_deref(), Some("A"));
        assert!((last.mean_confidence - 75.0).abs() < 1e-9);
        assert_eq!(last.distribution.get("A"), Some(&3));
        assert!(outcomes.iter().all(|o| o.shift.is_none()));

        // 3-3 tie resolves to A; mean moves from 80.0 (baseline) to ~78.3.
        let sixth = agg
            .submit(&topic, &"user-5".into(), "B", 95.0)
            .unwrap();
        assert_eq!(sixth.snapshot.majority.as_deref(), Some("A"));
        assert!((sixth.snapshot.mean_confidence - 78.333_333).abs() < 1e-5);
        assert!(sixth.shift.is_none());
    }

    #[test]
    fn running_mean_equals_arithmetic_mean() {
        let agg = ConsensusAggregator::new(1000.0);
        let topic = TopicId::from("t");
        let confs = [12.5, 99.0, 0.0, 47.25, 63.0, 81.5, 5.0];
        let votes: Vec<(&str, f64)> = confs.iter().map(|c| ("X", *c)).collect();
        let outcomes = submit_all(&agg, &topic, &votes);
        let expected = confs.iter().sum::<f64>() / confs.len() as f64;
        assert!((outcomes.last().unwrap().snapshot.mean_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn majority_change_emits_shift() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("t");
        let outcomes = submit_all(&agg, &topic, &[("A", 50.0), ("B", 50.0), ("B", 50.0)]);
        assert!(outcomes[1].shift.is_none(), "tie keeps A");
        let shift = outcomes[2].shift.as_ref().unwrap();
        assert_eq!(shift.previous_majority.as_deref(), Some("A"));
        assert_eq!(shift.majority, "B");
        assert!(shift.majority_changed());
        assert_eq!(shift.participants, 3);
    }

    #[test]
    fn confidence_move_is_measured_from_last_emitted() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("t");
        // Baseline 50, then creeping up by < 10 per step but >= 10 in total.
        let outcomes = submit_all(&agg, &topic, &[("A", 50.0), ("A", 66.0), ("A", 66.0)]);
        assert!(outcomes[1].shift.is_none(), "mean 58 moved 8");
        let shift = outcomes[2].shift.as_ref().unwrap();
        assert!((shift.previous_mean_confidence - 50.0).abs() < 1e-9);
        assert!(!shift.majority_changed());
    }

    #[test]
    fn threshold_is_tunable() {
        let agg = ConsensusAggregator::new(2.0);
        let topic = TopicId::from("t");
        let outcomes = submit_all(&agg, &topic, &[("A", 50.0), ("A", 55.0)]);
        assert!(outcomes[1].shift.is_some());
    }

    #[test]
    fn invalid_submissions_are_rejected() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("t");
        let who = RecipientId::from("u");
        for (choice, conf) in [("", 50.0), ("A", -1.0), ("A", 100.5), ("A", f64::NAN)] {
            assert!(matches!(
                agg.submit(&topic, &who, choice, conf),
                Err(CoreError::Validation { .. })
            ));
        }
        assert!(agg.snapshot(&topic).is_none(), "rejected input leaves no state");
    }

    #[test]
    fn closed_topic_rejects_submissions() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("t");
        agg.submit(&topic, &"u".into(), "A", 40.0).unwrap();
        let snap = agg.close_topic(&topic).unwrap();
        assert!(snap.closed);
        assert!(agg.submit(&topic, &"u".into(), "A", 40.0).is_err());
        assert!(matches!(
            agg.close_topic(&"missing".into()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn participants_are_unique_in_order() {
        let agg = ConsensusAggregator::default();
        let topic = TopicId::from("t");
        for who in ["b", "a", "b"] {
            agg.submit(&topic, &who.into(), "A", 10.0).unwrap();
        }
        assert_eq!(
            agg.participants(&topic),
            vec![RecipientId::from("b"), RecipientId::from("a")]
        );
        assert_eq!(agg.snapshot(&topic).unwrap().submissions, 3);
    }
}
