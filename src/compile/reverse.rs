//! Outcome back-propagation.
//!
//! A single reverse walk over the compiled entries, maintaining state
//! that only moves backward in time: the nearest future occurrence of
//! each labeled event class, and the lowest creatinine still to come.
//! Every entry gains its future-event labels; no entry is created or
//! removed, and the baseline lowering is the only retroactive edit to
//! forward-computed values.

use crate::compile::entry::TimelineEntry;
use crate::compile::store::ValueStore;
use crate::compile::PatientSummary;
use crate::meta::{names, FutureTarget, MetadataTable, VarId};
use crate::tdf::EventClass;
use crate::value::{FutureOutcome, Value};

/// Ordered day thresholds for horizon bucketing. Category i covers
/// `days_until <= HORIZON_BUCKETS[i]`; category 13 is "no known
/// occurrence within ten years".
pub const HORIZON_BUCKETS: [i64; 13] = [0, 1, 3, 7, 14, 30, 90, 180, 365, 730, 1095, 1825, 3650];

pub const NEVER_CATEGORY: u8 = 13;

/// Bucket the distance from `current_day` to a known `event_day`.
/// An occurrence on or before the current day lands in category 0
/// ("now or past"); no known occurrence is the terminal category.
pub fn compute_outcome_category(current_day: i64, event_day: Option<i64>) -> u8 {
    let Some(event_day) = event_day else {
        return NEVER_CATEGORY;
    };
    let delta = event_day - current_day;
    for (category, &threshold) in HORIZON_BUCKETS.iter().enumerate() {
        if delta <= threshold {
            return category as u8;
        }
    }
    NEVER_CATEGORY
}

fn outcome_for(entry_day: i64, event_day: Option<i64>) -> FutureOutcome {
    match event_day {
        Some(day) => FutureOutcome {
            occurs: true,
            days_until: (day > entry_day).then_some(day - entry_day),
            category: compute_outcome_category(entry_day, Some(day)),
        },
        None => FutureOutcome {
            occurs: false,
            days_until: None,
            category: NEVER_CATEGORY,
        },
    }
}

pub(crate) fn back_propagate(
    entries: &[TimelineEntry],
    store: &mut ValueStore,
    summary: &PatientSummary,
    table: &MetadataTable,
    carry_forward: bool,
) {
    if entries.is_empty() {
        return;
    }
    let labels: Vec<(VarId, Vec<FutureOutcome>)> = table
        .future_vars()
        .map(|(id, _, spec)| {
            let outcomes = match &spec.target {
                FutureTarget::Event(class) => event_labels(entries, summary, *class),
                FutureTarget::Milestone { progression, stage } => {
                    let onset = summary.milestone_onset(*progression, *stage);
                    entries
                        .iter()
                        .map(|e| outcome_for(e.day, onset))
                        .collect()
                }
                FutureTarget::DeathDuringAdmission => death_during_admission(entries, summary),
            };
            (id, outcomes)
        })
        .collect();
    for (id, outcomes) in labels {
        for (i, outcome) in outcomes.into_iter().enumerate() {
            store.set(id, i as u32, Value::Future(outcome));
        }
    }

    correct_baseline(entries, store, table, carry_forward);
}

/// Nearest-future-occurrence labels for one event class, accumulated by
/// the backward walk. A terminal event (death) that already happened
/// keeps reporting "now or past" on later entries.
fn event_labels(
    entries: &[TimelineEntry],
    summary: &PatientSummary,
    class: EventClass,
) -> Vec<FutureOutcome> {
    let terminal_day = (class == EventClass::Death)
        .then_some(summary.death_day)
        .flatten();
    let mut next: Option<i64> = None;
    let mut outcomes = vec![
        FutureOutcome {
            occurs: false,
            days_until: None,
            category: NEVER_CATEGORY
        };
        entries.len()
    ];
    for (i, entry) in entries.iter().enumerate().rev() {
        if entry.has_event(class) {
            next = Some(entry.day);
        }
        let known = next.or(match terminal_day {
            Some(day) if day <= entry.day => Some(day),
            _ => None,
        });
        outcomes[i] = outcome_for(entry.day, known);
    }
    outcomes
}

fn death_during_admission(entries: &[TimelineEntry], summary: &PatientSummary) -> Vec<FutureOutcome> {
    entries
        .iter()
        .map(|entry| {
            let death_here = summary.death_day.filter(|&death| {
                summary
                    .admission_containing(entry.day)
                    .is_some_and(|span| {
                        let open_end = summary.death_day.or(summary.last_day).unwrap_or(i64::MAX);
                        span.contains(death, open_end)
                    })
            });
            outcome_for(entry.day, death_here)
        })
        .collect()
}

/// Extend the baseline with future knowledge: the lowest creatinine seen
/// scanning backward. A forward baseline above it was an unresolved
/// acute excursion and is overwritten with the lower future value.
fn correct_baseline(
    entries: &[TimelineEntry],
    store: &mut ValueStore,
    table: &MetadataTable,
    carry_forward: bool,
) {
    let (Some(cr), Some(baseline)) = (table.id(names::CR), table.id(names::BASELINE_CR)) else {
        return;
    };
    let mut future_min = vec![f64::INFINITY; entries.len()];
    let mut running = f64::INFINITY;
    for i in (0..entries.len()).rev() {
        let value = if carry_forward {
            store.value_at(cr, i as u32)
        } else {
            store.value_set_at(cr, i as u32)
        };
        if let Some(v) = value.and_then(Value::as_f64) {
            running = running.min(v);
        }
        future_min[i] = running;
    }
    store.update_assignments(baseline, |from_entry, value| {
        if let Value::Float(stored) = value {
            let known = future_min[from_entry as usize];
            if known.is_finite() && known < *stored {
                *stored = known;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompiledTimeline, Finalized, TimelineCompiler};
    use crate::meta::{MedicationTable, MetadataTable};
    use crate::tdf::parse_patient;
    use crate::value::Value;

    fn compile(block: &str) -> CompiledTimeline<Finalized> {
        let compiler = TimelineCompiler::new(
            MetadataTable::clinical_default(),
            MedicationTable::clinical_default(),
        );
        compiler.compile_finalized(&parse_patient(block).expect("parse"))
    }

    fn future_at(timeline: &CompiledTimeline<Finalized>, name: &str, idx: u32) -> FutureOutcome {
        let id = timeline.table().id(name).expect("future var");
        match timeline.value_at_entry(id, idx) {
            Some(Value::Future(outcome)) => *outcome,
            other => panic!("expected future label for {name}, got {other:?}"),
        }
    }

    #[test]
    fn category_bucket_table() {
        assert_eq!(compute_outcome_category(10, Some(10)), 0);
        assert_eq!(compute_outcome_category(10, Some(8)), 0);
        assert_eq!(compute_outcome_category(10, Some(11)), 1);
        assert_eq!(compute_outcome_category(10, Some(13)), 2);
        assert_eq!(compute_outcome_category(10, Some(17)), 3);
        assert_eq!(compute_outcome_category(0, Some(30)), 5);
        assert_eq!(compute_outcome_category(0, Some(3650)), 12);
        assert_eq!(compute_outcome_category(0, Some(3651)), NEVER_CATEGORY);
        assert_eq!(compute_outcome_category(0, None), NEVER_CATEGORY);
    }

    #[test]
    fn days_until_counts_down_to_the_event() {
        let timeline = compile(
            "<Patient id=1 gender=M race=W>\n\
             <D C=L T=01:08:00>Cr=1.0</D>\n\
             <D C=L T=03:08:00>Cr=1.1</D>\n\
             <E C=Intubation T=06:10:00 />\n\
             <D C=L T=08:08:00>Cr=1.2</D>\n\
             </Patient>\n",
        );
        let d1 = future_at(&timeline, "FutureIntubation", 0);
        assert!(d1.occurs);
        assert_eq!(d1.days_until, Some(5));
        assert_eq!(d1.category, compute_outcome_category(1, Some(6)));

        let d3 = future_at(&timeline, "FutureIntubation", 1);
        assert_eq!(d3.days_until, Some(3));

        // On the event day itself: now-or-past, no countdown.
        let d6 = future_at(&timeline, "FutureIntubation", 2);
        assert!(d6.occurs);
        assert_eq!(d6.days_until, None);
        assert_eq!(d6.category, 0);

        // After a non-terminal event with no later occurrence.
        let d8 = future_at(&timeline, "FutureIntubation", 3);
        assert!(!d8.occurs);
        assert_eq!(d8.category, NEVER_CATEGORY);
    }

    #[test]
    fn terminal_death_reports_now_or_past_afterwards() {
        let timeline = compile(
            "<Patient id=1 gender=F race=W>\n\
             <D C=L T=02:08:00>Cr=1.0</D>\n\
             <E C=Death T=05:12:00 />\n\
             </Patient>\n",
        );
        let before = future_at(&timeline, "FutureDeath", 0);
        assert!(before.occurs);
        assert_eq!(before.days_until, Some(3));
        let at = future_at(&timeline, "FutureDeath", 1);
        assert_eq!(at.category, 0);
        assert_eq!(at.days_until, None);
    }

    #[test]
    fn death_during_admission_is_scoped_to_the_stay() {
        let timeline = compile(
            "<Patient id=1 gender=M race=W>\n\
             <E C=Admit T=01:07:00 />\n\
             <D C=L T=02:08:00>Cr=1.0</D>\n\
             <E C=Discharge T=04:15:00 />\n\
             <E C=Admit T=20:07:00 />\n\
             <D C=L T=21:08:00>Cr=1.1</D>\n\
             <E C=Death T=23:12:00 />\n\
             </Patient>\n",
        );
        // First stay: the death belongs to a later stay.
        let first = future_at(&timeline, "WillDieThisAdmission", 0);
        assert!(!first.occurs);
        // Second stay: death falls inside it.
        let idx = timeline
            .entries()
            .iter()
            .position(|e| e.day == 21)
            .unwrap() as u32;
        let second = future_at(&timeline, "WillDieThisAdmission", idx);
        assert!(second.occurs);
        assert_eq!(second.days_until, Some(2));
    }

    #[test]
    fn baseline_is_lowered_by_future_knowledge() {
        // Admitted in AKI: the first measured creatinine is the acute
        // peak, and the true baseline only appears later.
        let timeline = compile(
            "<Patient id=1 gender=M race=W>\n\
             <D C=L T=01:08:00>Cr=3.0</D>\n\
             <D C=L T=02:08:00>Cr=2.5</D>\n\
             <D C=L T=20:08:00>Cr=1.0</D>\n\
             </Patient>\n",
        );
        let baseline = timeline.table().id(names::BASELINE_CR).unwrap();
        // Forward, day 1's baseline was 3.0; the reverse pass rewrites
        // it to the future-known minimum.
        assert_eq!(
            timeline.value_at_entry(baseline, 0).unwrap().as_f64(),
            Some(1.0)
        );
        assert_eq!(
            timeline.value_at_entry(baseline, 1).unwrap().as_f64(),
            Some(1.0)
        );
    }

    #[test]
    fn milestone_label_uses_finalized_onsets() {
        // eGFR collapses below 30 on day 10 and never recovers: kidney
        // stage 4 onset is day 10.
        let timeline = compile(
            "<Patient id=1 gender=M race=W>\n\
             <D C=V T=01:07:00>AgeYears=60</D>\n\
             <D C=L T=01:08:00>Cr=1.0</D>\n\
             <D C=L T=10:08:00>Cr=4.0</D>\n\
             <D C=L T=12:08:00>Cr=4.2</D>\n\
             </Patient>\n",
        );
        let label = future_at(&timeline, "FutureKidneyStage4", 1);
        assert!(label.occurs);
        assert_eq!(label.days_until, Some(9));
        let at_onset = future_at(&timeline, "FutureKidneyStage4", 2);
        assert_eq!(at_onset.category, 0);
    }
}
