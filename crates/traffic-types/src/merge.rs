//! Per-field merge rules applied when a snapshot sighting meets stored state.
//!
//! Both store backends route every write decision through this module so the
//! delay-peak and end-time rules live in one place.

use chrono::{DateTime, TimeDelta, Utc};

use crate::Incident;

/// The part of a stored row that decides how a new sighting is merged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredPeak {
    pub delay: Option<f64>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Write to perform for one sighting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SightingDecision {
    /// First sighting: store the incident verbatim.
    Insert,
    /// Delay peak rose: overwrite descriptive fields, keep the later end time.
    Escalate { end_time: Option<DateTime<Utc>> },
    /// Nothing new: only `last_seen` moves.
    Refresh,
}

impl SightingDecision {
    pub fn outcome(self) -> UpsertOutcome {
        match self {
            Self::Insert => UpsertOutcome {
                changed: true,
                inserted: true,
            },
            Self::Escalate { .. } => UpsertOutcome {
                changed: true,
                inserted: false,
            },
            Self::Refresh => UpsertOutcome::default(),
        }
    }
}

/// Result of reconciling a single record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub changed: bool,
    pub inserted: bool,
}

/// Null delays compare as zero.
pub fn comparable_delay(delay: Option<f64>) -> f64 {
    delay.unwrap_or(0.0)
}

pub fn decide_sighting(stored: Option<&StoredPeak>, incoming: &Incident) -> SightingDecision {
    let Some(stored) = stored else {
        return SightingDecision::Insert;
    };
    if comparable_delay(incoming.delay) > comparable_delay(stored.delay) {
        SightingDecision::Escalate {
            end_time: later_end_time(incoming.end_time, stored.end_time),
        }
    } else {
        SightingDecision::Refresh
    }
}

/// Missing end times impose no constraint; two present end times keep the max.
pub fn later_end_time(
    incoming: Option<DateTime<Utc>>,
    stored: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => Some(incoming.max(stored)),
        (incoming, stored) => incoming.or(stored),
    }
}

/// True when an incident last seen at `last_seen` has been absent longer
/// than `threshold` at `now`.
pub fn is_stale(last_seen: DateTime<Utc>, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
    expiry_cutoff(now, threshold).is_some_and(|cutoff| last_seen < cutoff)
}

/// Latest `last_seen` that still counts as present at `now`, or `None` when
/// the threshold reaches past the earliest representable time.
pub fn expiry_cutoff(now: DateTime<Utc>, threshold: TimeDelta) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(threshold)
}

/// End time stamped on an incident that dropped out of the feed: one
/// threshold window after it started, but never before its last sighting.
pub fn synthesized_end_time(
    start_time: DateTime<Utc>,
    last_seen: Option<DateTime<Utc>>,
    threshold: TimeDelta,
) -> DateTime<Utc> {
    match (start_time.checked_add_signed(threshold), last_seen) {
        (Some(candidate), Some(last_seen)) => candidate.max(last_seen),
        (Some(candidate), None) => candidate,
        (None, last_seen) => last_seen.unwrap_or(start_time),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decide_sighting, expiry_cutoff, is_stale, later_end_time, synthesized_end_time,
        SightingDecision, StoredPeak, UpsertOutcome,
    };
    use crate::{Geometry, Incident};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(seconds)
    }

    fn incident(delay: Option<f64>, end_time: Option<DateTime<Utc>>) -> Incident {
        Incident {
            id: "inc-1".to_string(),
            category: 6,
            geometry: Geometry::Point(vec![103.8, 1.35]),
            magnitude_of_delay: 2,
            start_time: at(0),
            end_time,
            from_location: None,
            to_location: None,
            length: None,
            delay,
            road_numbers: Vec::new(),
            time_validity: None,
            probability_of_occurrence: None,
            number_of_reports: 0,
            last_report_time: None,
            events: Vec::new(),
            tmc: None,
        }
    }

    #[test]
    fn unit_first_sighting_inserts() {
        let decision = decide_sighting(None, &incident(None, None));
        assert_eq!(decision, SightingDecision::Insert);
        assert_eq!(
            decision.outcome(),
            UpsertOutcome {
                changed: true,
                inserted: true
            }
        );
    }

    #[test]
    fn unit_delay_must_strictly_increase_to_escalate() {
        let stored = StoredPeak {
            delay: Some(3.0),
            end_time: None,
        };
        assert_eq!(
            decide_sighting(Some(&stored), &incident(Some(3.0), None)),
            SightingDecision::Refresh
        );
        assert_eq!(
            decide_sighting(Some(&stored), &incident(Some(1.0), None)),
            SightingDecision::Refresh
        );
        assert_eq!(
            decide_sighting(Some(&stored), &incident(Some(7.0), None)),
            SightingDecision::Escalate { end_time: None }
        );
    }

    #[test]
    fn unit_null_delays_compare_as_zero() {
        let stored = StoredPeak {
            delay: None,
            end_time: None,
        };
        assert_eq!(
            decide_sighting(Some(&stored), &incident(None, None)),
            SightingDecision::Refresh
        );
        assert_eq!(
            decide_sighting(Some(&stored), &incident(Some(0.5), None)).outcome(),
            UpsertOutcome {
                changed: true,
                inserted: false
            }
        );
    }

    #[test]
    fn unit_escalation_keeps_the_later_end_time() {
        let stored = StoredPeak {
            delay: Some(1.0),
            end_time: Some(at(600)),
        };
        assert_eq!(
            decide_sighting(Some(&stored), &incident(Some(2.0), Some(at(300)))),
            SightingDecision::Escalate {
                end_time: Some(at(600))
            }
        );
        assert_eq!(later_end_time(Some(at(900)), Some(at(600))), Some(at(900)));
        assert_eq!(later_end_time(None, Some(at(600))), Some(at(600)));
        assert_eq!(later_end_time(Some(at(60)), None), Some(at(60)));
        assert_eq!(later_end_time(None, None), None);
    }

    #[test]
    fn unit_synthesized_end_time_never_precedes_last_seen() {
        let threshold = TimeDelta::minutes(5);
        assert_eq!(synthesized_end_time(at(0), None, threshold), at(300));
        assert_eq!(synthesized_end_time(at(0), Some(at(120)), threshold), at(300));
        assert_eq!(
            synthesized_end_time(at(0), Some(at(3_600)), threshold),
            at(3_600)
        );
    }

    #[test]
    fn unit_staleness_is_strict() {
        let threshold = TimeDelta::seconds(40);
        assert!(!is_stale(at(0), at(40), threshold));
        assert!(is_stale(at(0), at(41), threshold));
    }

    #[test]
    fn regression_out_of_range_threshold_saturates_instead_of_panicking() {
        let threshold = TimeDelta::seconds(150_000_000_000 * 60);
        assert_eq!(expiry_cutoff(at(0), threshold), None);
        assert!(!is_stale(at(0), at(60), threshold));
        assert_eq!(synthesized_end_time(at(0), Some(at(120)), threshold), at(120));
        assert_eq!(synthesized_end_time(at(0), None, threshold), at(0));
    }
}
