//! Read-only queries over a finalized timeline.
//!
//! The phase marker on [`CompiledTimeline`] keeps a forward-only
//! timeline out of here: every accessor takes `Finalized`, so future
//! labels and corrected baselines are always present.

use crate::compile::{CompiledTimeline, Finalized};
use crate::error::{Error, Result};
use crate::meta::VarId;
use crate::resolve::VarRef;
use crate::value::{Relation, Value};

/// Backward offset lookups ignore values more than a year older than the
/// target day; anything staler is an unrelated baseline.
const BACKWARD_STALENESS_DAYS: i64 = 365;

/// Forward offset lookups give up after sixty days.
const FORWARD_STALENESS_DAYS: i64 = 60;

/// One filter clause: `name <relation> value`.
#[derive(Debug, Clone)]
pub struct Criterion {
    pub name: String,
    pub relation: Relation,
    pub value: Value,
}

/// A value sampled in a day range.
#[derive(Debug, Clone, PartialEq)]
pub struct DayValue {
    pub day: i64,
    pub value: Value,
}

pub struct TimelineQuery<'a> {
    timeline: &'a CompiledTimeline<Finalized>,
}

impl<'a> TimelineQuery<'a> {
    pub fn new(timeline: &'a CompiledTimeline<Finalized>) -> Self {
        Self { timeline }
    }

    /// Value of a reference at one timeline index. Offset 0 reads the
    /// entry directly; a negative offset scans backward to the value as
    /// of `day + offset`, a positive offset scans forward, both subject
    /// to the staleness cutoffs. Returns `None` for unknown stems,
    /// missing values, and transforms with insufficient history.
    pub fn value_at(&self, index: usize, var: &VarRef) -> Option<Value> {
        let id = self.timeline.table().id(&var.stem)?;
        let entry = self.timeline.entry(index)?;
        let target = if var.offset == 0 {
            index
        } else {
            let target_day = entry.day + var.offset;
            if var.offset < 0 {
                let found = self.last_entry_at_or_before(target_day)?;
                let found_day = self.timeline.entry(found)?.day;
                if target_day - found_day > BACKWARD_STALENESS_DAYS {
                    return None;
                }
                found
            } else {
                let found = self.first_entry_at_or_after(target_day)?;
                let found_day = self.timeline.entry(found)?.day;
                if found_day - target_day > FORWARD_STALENESS_DAYS {
                    return None;
                }
                found
            }
        };
        match var.transform {
            None => self.timeline.value_at_entry(id, target as u32).cloned(),
            Some(kind) => self.replay_transform(id, kind, target).map(Value::Float),
        }
    }

    /// Replay a transform over the stem's assignment history up to and
    /// including `index`. Transforms are stateful, so history must be
    /// rebuilt from the start of the record; the instance is fresh and
    /// therefore reset by construction.
    fn replay_transform(
        &self,
        id: VarId,
        kind: crate::timefunc::TransformKind,
        index: usize,
    ) -> Option<f64> {
        let mut function = kind.instantiate();
        let mut out = None;
        for (from_entry, value) in self.timeline.store().assignments(id) {
            if from_entry as usize > index {
                break;
            }
            let Some(raw) = value.as_f64() else { continue };
            let entry = self.timeline.entry(from_entry as usize)?;
            out = function.compute_new_value(raw, entry.day, entry.interval);
        }
        out
    }

    /// Values assigned to a stem inside `[first_day, last_day]`, clipped
    /// to the variable's declared range. With `dedupe_per_day`, one
    /// value per day is kept: the day's close-out state.
    pub fn values_in_day_range(
        &self,
        stem: &str,
        first_day: i64,
        last_day: i64,
        dedupe_per_day: bool,
    ) -> Vec<DayValue> {
        let Some(id) = self.timeline.table().id(stem) else {
            return Vec::new();
        };
        let descriptor = self.timeline.table().descriptor(id);
        let mut out: Vec<DayValue> = Vec::new();
        for (from_entry, value) in self.timeline.store().assignments(id) {
            let Some(entry) = self.timeline.entry(from_entry as usize) else {
                continue;
            };
            if entry.day < first_day || entry.day > last_day {
                continue;
            }
            let value = match value {
                Value::Float(v) => Value::Float(descriptor.clamp(*v)),
                Value::Int(v) => Value::Int(descriptor.clamp(*v as f64).round() as i64),
                other => other.clone(),
            };
            if dedupe_per_day {
                if let Some(last) = out.last_mut() {
                    if last.day == entry.day {
                        last.value = value;
                        continue;
                    }
                }
            }
            out.push(DayValue {
                day: entry.day,
                value,
            });
        }
        out
    }

    /// Whether the entry at `index` satisfies every criterion. A missing
    /// or invalid operand never matches and never panics.
    pub fn matches_criteria(&self, index: usize, criteria: &[Criterion]) -> bool {
        criteria.iter().all(|criterion| {
            let Ok(var) = crate::resolve::resolve(self.timeline.table(), &criterion.name) else {
                return false;
            };
            let Some(left) = self.value_at(index, &var) else {
                return false;
            };
            criterion.relation.evaluate(&left, &criterion.value)
        })
    }

    /// Usable index bounds when extracting `target` as a label. For a
    /// future-event target the tail of the timeline is clipped so that
    /// every returned index has the target's full lookahead horizon
    /// inside the record; a patient without enough lookahead anywhere
    /// has no usable window at all.
    pub fn bounds_for_extraction(&self, target: &str) -> Result<(usize, usize)> {
        let descriptor = self
            .timeline
            .table()
            .get(target)
            .ok_or_else(|| Error::UnknownVariable(target.to_string()))?;
        if self.timeline.is_empty() {
            return Err(Error::InsufficientFutureWindow(target.to_string()));
        }
        let last_index = self.timeline.len() - 1;
        let Some(spec) = &descriptor.future else {
            return Ok((0, last_index));
        };
        let last_day = self.timeline.entry(last_index).map(|e| e.day).unwrap_or(0);
        let usable = self
            .timeline
            .entries()
            .iter()
            .rposition(|e| e.day + spec.horizon_days <= last_day)
            .ok_or_else(|| Error::InsufficientFutureWindow(target.to_string()))?;
        Ok((0, usable))
    }

    /// Last index whose day is at or before `day`.
    fn last_entry_at_or_before(&self, day: i64) -> Option<usize> {
        let entries = self.timeline.entries();
        let idx = entries.partition_point(|e| e.day <= day);
        idx.checked_sub(1)
    }

    /// First index whose day is at or after `day`.
    fn first_entry_at_or_after(&self, day: i64) -> Option<usize> {
        let entries = self.timeline.entries();
        let idx = entries.partition_point(|e| e.day < day);
        (idx < entries.len()).then_some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::TimelineCompiler;
    use crate::meta::{names, MedicationTable, MetadataTable};
    use crate::resolve::resolve;
    use crate::tdf::parse_patient;
    use crate::timefunc::TransformKind;

    fn compiled(block: &str) -> CompiledTimeline<Finalized> {
        let compiler = TimelineCompiler::new(
            MetadataTable::clinical_default(),
            MedicationTable::clinical_default(),
        );
        compiler.compile_finalized(&parse_patient(block).expect("parse"))
    }

    fn timeline() -> CompiledTimeline<Finalized> {
        compiled(
            "<Patient id=1 gender=M race=W>\n\
             <D C=L T=01:08:00>Cr=1.0,Na=140</D>\n\
             <D C=L T=03:08:00>Cr=2.9</D>\n\
             <D C=L T=06:08:00>Cr=1.4</D>\n\
             <D C=L T=500:08:00>Cr=1.1</D>\n\
             </Patient>\n",
        )
    }

    #[test]
    fn offset_zero_reads_the_entry() {
        let timeline = timeline();
        let query = TimelineQuery::new(&timeline);
        let var = resolve(timeline.table(), "Cr").unwrap();
        assert_eq!(query.value_at(1, &var), Some(Value::Float(2.9)));
        // Sodium carries forward from entry 0.
        let na = resolve(timeline.table(), "Na").unwrap();
        assert_eq!(query.value_at(2, &na), Some(Value::Float(140.0)));
    }

    #[test]
    fn negative_offset_scans_backward_with_staleness_cutoff() {
        let timeline = timeline();
        let query = TimelineQuery::new(&timeline);
        // From day 6, Cr[-3] is the value as of day 3.
        let var = resolve(timeline.table(), "Cr[-3]").unwrap();
        assert_eq!(query.value_at(2, &var), Some(Value::Float(2.9)));
        // From day 500, Cr[-2] finds day 6, which is 492 days stale.
        let var = resolve(timeline.table(), "Cr[-2]").unwrap();
        assert_eq!(query.value_at(3, &var), None);
    }

    #[test]
    fn positive_offset_scans_forward_with_cutoff() {
        let timeline = timeline();
        let query = TimelineQuery::new(&timeline);
        // From day 1, Cr[+2] reads day 3.
        let var = resolve(timeline.table(), "Cr[+2]").unwrap();
        assert_eq!(query.value_at(0, &var), Some(Value::Float(2.9)));
        // From day 6 a +2 offset would land on day 500: past the cutoff.
        assert_eq!(query.value_at(2, &var), None);
    }

    #[test]
    fn transform_replays_history_at_the_entry() {
        let timeline = timeline();
        let query = TimelineQuery::new(&timeline);
        let var = resolve(timeline.table(), "Cr.delta").unwrap();
        // First sample has no delta.
        assert_eq!(query.value_at(0, &var), None);
        match query.value_at(1, &var) {
            Some(Value::Float(v)) => assert!((v - 1.9).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        let rate = resolve(timeline.table(), "Cr.rate").unwrap();
        match query.value_at(1, &rate) {
            Some(Value::Float(v)) => assert!((v - 0.95).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(var.transform, Some(TransformKind::Delta));
    }

    #[test]
    fn day_range_dedupes_to_close_out_state() {
        let timeline = compiled(
            "<Patient id=1 gender=M race=W>\n\
             <D C=L T=02:06:00>Cr=1.0</D>\n\
             <D C=L T=02:18:00>Cr=1.6</D>\n\
             <D C=L T=04:08:00>Cr=1.2</D>\n\
             </Patient>\n",
        );
        let query = TimelineQuery::new(&timeline);
        let all = query.values_in_day_range(names::CR, 0, 10, false);
        assert_eq!(all.len(), 3);
        let deduped = query.values_in_day_range(names::CR, 0, 10, true);
        assert_eq!(
            deduped,
            vec![
                DayValue {
                    day: 2,
                    value: Value::Float(1.6)
                },
                DayValue {
                    day: 4,
                    value: Value::Float(1.2)
                },
            ]
        );
        assert!(query.values_in_day_range(names::CR, 3, 3, false).is_empty());
    }

    #[test]
    fn criteria_missing_operands_never_match() {
        let timeline = timeline();
        let query = TimelineQuery::new(&timeline);
        let in_aki = Criterion {
            name: names::IN_AKI.to_string(),
            relation: Relation::Eq,
            value: Value::Bool(true),
        };
        assert!(!query.matches_criteria(0, &[in_aki.clone()]));
        assert!(query.matches_criteria(1, &[in_aki]));

        let unknown = Criterion {
            name: "NoSuchVar".to_string(),
            relation: Relation::Eq,
            value: Value::Float(1.0),
        };
        assert!(!query.matches_criteria(0, &[unknown]));

        // Criteria can use the reference grammar.
        let prior = Criterion {
            name: "Cr[-3]".to_string(),
            relation: Relation::Ge,
            value: Value::Float(2.0),
        };
        assert!(query.matches_criteria(2, &[prior]));
    }

    #[test]
    fn extraction_bounds_clip_the_future_window() {
        let timeline = compiled(
            "<Patient id=1 gender=M race=W>\n\
             <D C=L T=01:08:00>Cr=1.0</D>\n\
             <D C=L T=20:08:00>Cr=1.1</D>\n\
             <D C=L T=40:08:00>Cr=1.2</D>\n\
             </Patient>\n",
        );
        let query = TimelineQuery::new(&timeline);
        // Plain variables keep the full range.
        assert_eq!(query.bounds_for_extraction(names::CR).unwrap(), (0, 2));
        // A 30-day-horizon label: only day 1 has 30 days of lookahead
        // inside the record.
        assert_eq!(
            query.bounds_for_extraction(names::FUTURE_INTUBATION).unwrap(),
            (0, 0)
        );
        // A 365-day horizon has no usable window at all here.
        assert!(matches!(
            query.bounds_for_extraction(names::WILL_DIE_THIS_ADMISSION),
            Err(Error::InsufficientFutureWindow(_))
        ));
    }
}
