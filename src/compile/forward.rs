//! Forward-pass compilation.
//!
//! One self-transition per raw element, in file order. The principal
//! state is the current timeline entry plus the per-patient accumulator;
//! everything a later pass needs (admission spans, death day, milestone
//! trackers) is folded into the patient summary at the end.
//!
//! Per-element failures recover locally: an unknown variable name drops
//! that single assignment, an unparseable number is stripped and retried
//! once, an out-of-order timestamp is clamped to repeat the preceding
//! one. None of these abort the surrounding patient.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::compile::derived::{ValueView, DERIVED_TABLE, KIDNEY_MAX_STAGE, LIVER_MAX_STAGE};
use crate::compile::entry::{EventRecord, TimelineEntry};
use crate::compile::milestone::StageTracker;
use crate::compile::store::ValueStore;
use crate::compile::{AdmissionSpan, CompiledTimeline, Finalized, Forward, PatientSummary};
use crate::meta::{names, MedicationTable, MetadataTable, ResetRule, VarId, VarKind};
use crate::tdf::{DataClass, ElementKind, EventClass, PatientRecord, Timestamp};
use crate::value::{parse_bool, parse_number, Value};

/// Days of history feeding the rolling minimum used as the causal
/// baseline-creatinine estimate.
const BASELINE_WINDOW_DAYS: i64 = 7;

/// Compiler knobs, loaded once and shared read-only.
#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    /// Carry each entry's state forward into the next (the default).
    /// When off, every entry starts from an empty baseline.
    pub carry_forward: bool,
    /// Clamp out-of-range numeric values to the variable's [min, max]
    /// instead of dropping them.
    pub clamp_out_of_range: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            carry_forward: true,
            clamp_out_of_range: true,
        }
    }
}

/// Per-patient mutable compiler scratch. Created per record, folded into
/// the summary at finish, destroyed afterwards.
struct PatientContext {
    latest: Vec<Option<Value>>,
    pending_doses: HashMap<VarId, f64>,
    cr_window: VecDeque<(i64, f64)>,
    open_admission: Option<i64>,
    admissions: Vec<AdmissionSpan>,
    death_day: Option<i64>,
    kidney: StageTracker,
    liver: StageTracker,
    prev_ts: Option<Timestamp>,
}

impl PatientContext {
    fn new(var_count: usize) -> Self {
        Self {
            latest: vec![None; var_count],
            pending_doses: HashMap::new(),
            cr_window: VecDeque::new(),
            open_admission: None,
            admissions: Vec::new(),
            death_day: None,
            kidney: StageTracker::new(KIDNEY_MAX_STAGE),
            liver: StageTracker::new(LIVER_MAX_STAGE),
            prev_ts: None,
        }
    }
}

struct AccumulatorView<'a> {
    table: &'a MetadataTable,
    latest: &'a [Option<Value>],
}

impl ValueView for AccumulatorView<'_> {
    fn number(&self, name: &str) -> Option<f64> {
        let id = self.table.id(name)?;
        self.latest[id.index()].as_ref()?.as_f64()
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let id = self.table.id(name)?;
        self.latest[id.index()].as_ref()?.as_bool()
    }
}

/// The two-pass compiler's forward half. One instance serves many
/// patients; the metadata and medication tables are shared read-only.
pub struct TimelineCompiler {
    table: Arc<MetadataTable>,
    meds: Arc<MedicationTable>,
    config: CompilerConfig,
}

impl TimelineCompiler {
    pub fn new(table: Arc<MetadataTable>, meds: Arc<MedicationTable>) -> Self {
        Self::with_config(table, meds, CompilerConfig::default())
    }

    pub fn with_config(
        table: Arc<MetadataTable>,
        meds: Arc<MedicationTable>,
        config: CompilerConfig,
    ) -> Self {
        Self {
            table,
            meds,
            config,
        }
    }

    pub fn table(&self) -> &Arc<MetadataTable> {
        &self.table
    }

    /// Run the forward pass over one located patient record.
    pub fn compile(&self, record: &PatientRecord) -> CompiledTimeline<Forward> {
        let mut ctx = PatientContext::new(self.table.len());
        let mut store = ValueStore::new(self.table.len());
        let mut entries: Vec<TimelineEntry> = Vec::new();

        self.seed_demographics(&mut ctx, &mut store, record);

        for element in &record.elements {
            // Timestamp repair: a regression within one patient is a
            // known source-data defect, corrected by repeating the
            // preceding timestamp.
            let mut ts = element.ts;
            if let Some(prev) = ctx.prev_ts {
                if ts < prev {
                    log::warn!(
                        "patient {}: timestamp {ts} out of order, repeating {prev}",
                        record.header.id
                    );
                    ts = prev;
                }
            }
            ctx.prev_ts = Some(ts);

            if matches!(element.kind, ElementKind::Text { .. }) {
                continue;
            }

            self.advance_entry(&mut ctx, &mut store, &mut entries, &element.kind, ts);
            let idx = (entries.len() - 1) as u32;
            let entry = entries.last_mut().expect("entry just opened");

            match &element.kind {
                ElementKind::Event {
                    class,
                    value,
                    detail,
                } => {
                    entry.events.push(EventRecord {
                        class: *class,
                        value: value.clone(),
                        detail: detail.clone(),
                        ts,
                    });
                    self.apply_event(&mut ctx, &mut store, idx, ts.day, *class, value, detail);
                }
                ElementKind::Data { class, assignments } => {
                    for (name, raw) in assignments {
                        self.apply_assignment(&mut ctx, &mut store, idx, ts.day, *class, name, raw);
                    }
                }
                ElementKind::Outcome { flags, .. } => {
                    for (name, raw) in flags {
                        self.apply_outcome_flag(&mut ctx, &mut store, idx, name, raw);
                    }
                }
                ElementKind::Text { .. } => unreachable!("text handled above"),
            }

            self.recompute_derived(&mut ctx, &mut store, idx, ts.day);
        }

        if let Some(last) = entries.last() {
            let idx = last.seq;
            let day = last.day;
            self.fold_pending_doses(&mut ctx, &mut store, idx);
            self.observe_milestones(&mut ctx, day);
        }

        let mut admissions = std::mem::take(&mut ctx.admissions);
        if let Some(admit) = ctx.open_admission.take() {
            admissions.push(AdmissionSpan {
                admit,
                discharge: None,
            });
        }
        let summary = PatientSummary {
            patient_id: record.header.id.clone(),
            gender: record.header.gender.clone(),
            race: record.header.race.clone(),
            first_day: entries.first().map(|e| e.day),
            last_day: entries.last().map(|e| e.day),
            admissions,
            death_day: ctx.death_day,
            kidney: ctx.kidney.clone(),
            liver: ctx.liver.clone(),
        };

        CompiledTimeline::new_forward(
            entries,
            store,
            summary,
            Arc::clone(&self.table),
            self.config.carry_forward,
        )
    }

    /// Forward pass plus finalization in one call.
    pub fn compile_finalized(&self, record: &PatientRecord) -> CompiledTimeline<Finalized> {
        self.compile(record).finalize()
    }

    fn seed_demographics(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        record: &PatientRecord,
    ) {
        let header = &record.header;
        if !header.gender.is_empty() {
            let male = header.gender.eq_ignore_ascii_case("M");
            self.assign_by_name(ctx, store, 0, names::IS_MALE, Value::Bool(male));
        }
        if !header.race.is_empty() {
            let black =
                header.race.eq_ignore_ascii_case("B") || header.race.eq_ignore_ascii_case("Black");
            self.assign_by_name(ctx, store, 0, names::IS_BLACK, Value::Bool(black));
        }
    }

    /// Open a new entry unless the element merges into the current one.
    fn advance_entry(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        entries: &mut Vec<TimelineEntry>,
        kind: &ElementKind,
        ts: Timestamp,
    ) {
        let merges = match entries.last() {
            None => false,
            Some(current) => {
                let same_instant =
                    current.day == ts.day && current.interval == ts.minute_of_day();
                let merging_kind = match kind {
                    // Outcomes always merge into whatever is most recent.
                    ElementKind::Outcome { .. } => true,
                    // Events and diagnoses merge at day granularity.
                    ElementKind::Event { .. } => current.day == ts.day,
                    ElementKind::Data { class, .. } => {
                        *class == DataClass::Diagnosis && current.day == ts.day
                    }
                    ElementKind::Text { .. } => false,
                };
                same_instant || merging_kind
            }
        };
        if merges {
            return;
        }

        let day_changed = entries.last().is_some_and(|e| e.day != ts.day);
        if day_changed {
            let closing = entries.last().expect("previous entry exists");
            let closing_idx = closing.seq;
            let closing_day = closing.day;
            self.fold_pending_doses(ctx, store, closing_idx);
            self.observe_milestones(ctx, closing_day);
        }

        let seq = entries.len() as u32;
        entries.push(TimelineEntry::new(ts.day, ts.minute_of_day(), seq));

        if !self.config.carry_forward {
            // Fixed empty baseline for every fresh entry.
            ctx.latest.iter_mut().for_each(|slot| *slot = None);
        } else if day_changed {
            self.apply_daily_resets(ctx, store, seq);
        }
    }

    /// Day-transition exclusions from carry-forward: per-day counters
    /// restart at zero, daily dose totals become unset, day-transition
    /// flags are removed outright.
    fn apply_daily_resets(&self, ctx: &mut PatientContext, store: &mut ValueStore, entry: u32) {
        for (id, descriptor) in self.table.daily_reset_vars() {
            match descriptor.reset {
                ResetRule::Carry => {}
                ResetRule::ZeroEachDay => {
                    let zero = match descriptor.kind {
                        VarKind::Float => Value::Float(0.0),
                        _ => Value::Int(0),
                    };
                    ctx.latest[id.index()] = Some(zero.clone());
                    store.set(id, entry, zero);
                }
                ResetRule::UnsetEachDay | ResetRule::RemoveEachDay => {
                    if ctx.latest[id.index()].take().is_some() {
                        store.unset(id, entry);
                    }
                }
            }
        }
    }

    /// Day close-out: the day's accumulated dose events become one total
    /// per drug on the day's final entry.
    fn fold_pending_doses(&self, ctx: &mut PatientContext, store: &mut ValueStore, entry: u32) {
        if ctx.pending_doses.is_empty() {
            return;
        }
        let totals: Vec<(VarId, f64)> = ctx.pending_doses.drain().collect();
        for (id, total) in totals {
            log::debug!(
                "close-out: {} = {total}",
                self.table.descriptor(id).name
            );
            self.assign(ctx, store, entry, id, Value::Float(total));
        }
    }

    /// Milestone sub-pass at day close: feed the day's final stage
    /// values to the monotonic onset trackers.
    fn observe_milestones(&self, ctx: &mut PatientContext, day: i64) {
        let stage_of = |ctx: &PatientContext, name: &str| -> Option<u8> {
            let id = self.table.id(name)?;
            let stage = ctx.latest[id.index()].as_ref()?.as_i64()?;
            u8::try_from(stage).ok()
        };
        if let Some(stage) = stage_of(ctx, names::KIDNEY_STAGE) {
            ctx.kidney.observe(stage, day);
        }
        if let Some(stage) = stage_of(ctx, names::LIVER_STAGE) {
            ctx.liver.observe(stage, day);
        }
    }

    fn apply_event(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        day: i64,
        class: EventClass,
        value: &Option<String>,
        detail: &Option<String>,
    ) {
        match class {
            EventClass::Admit => {
                self.assign_by_name(ctx, store, idx, names::INPATIENT, Value::Bool(true));
                self.assign_by_name(ctx, store, idx, names::ADMITTED_TODAY, Value::Bool(true));
                if ctx.open_admission.is_none() {
                    ctx.open_admission = Some(day);
                }
            }
            EventClass::Discharge => {
                self.assign_by_name(ctx, store, idx, names::INPATIENT, Value::Bool(false));
                self.assign_by_name(ctx, store, idx, names::DISCHARGED_TODAY, Value::Bool(true));
                if let Some(admit) = ctx.open_admission.take() {
                    ctx.admissions.push(AdmissionSpan {
                        admit,
                        discharge: Some(day),
                    });
                }
            }
            EventClass::Death => {
                ctx.death_day = Some(day);
                if let Some(admit) = ctx.open_admission.take() {
                    ctx.admissions.push(AdmissionSpan {
                        admit,
                        discharge: Some(day),
                    });
                }
            }
            EventClass::IcuIn => {
                self.assign_by_name(ctx, store, idx, names::IN_ICU, Value::Bool(true));
            }
            EventClass::IcuOut => {
                self.assign_by_name(ctx, store, idx, names::IN_ICU, Value::Bool(false));
            }
            EventClass::Intubation => {
                self.assign_by_name(ctx, store, idx, names::INTUBATED, Value::Bool(true));
            }
            EventClass::Extubation => {
                self.assign_by_name(ctx, store, idx, names::INTUBATED, Value::Bool(false));
            }
            EventClass::Dialysis => {
                self.assign_by_name(ctx, store, idx, names::ON_DIALYSIS, Value::Bool(true));
            }
            EventClass::DialysisEnd => {
                self.assign_by_name(ctx, store, idx, names::ON_DIALYSIS, Value::Bool(false));
            }
            EventClass::Surgery => {
                self.increment(ctx, store, idx, names::SURGERIES_TODAY);
            }
            EventClass::Procedure => {
                self.increment(ctx, store, idx, names::PROCEDURES_TODAY);
            }
            EventClass::Med => {
                self.accumulate_dose(ctx, value, detail);
            }
        }
    }

    fn accumulate_dose(
        &self,
        ctx: &mut PatientContext,
        value: &Option<String>,
        detail: &Option<String>,
    ) {
        let Some(dose) = value.as_deref().and_then(parse_number) else {
            log::warn!("dose event without a parseable amount, skipping");
            return;
        };
        let Some(drug) = detail.as_deref() else {
            log::warn!("dose event without a drug name, skipping");
            return;
        };
        let Some(var) = self.meds.dose_variable(drug) else {
            log::warn!("unknown drug {drug:?}, skipping dose");
            return;
        };
        let Some(id) = self.table.id(var) else {
            log::warn!("medication table names unknown variable {var:?}");
            return;
        };
        *ctx.pending_doses.entry(id).or_insert(0.0) += dose;
    }

    fn apply_assignment(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        day: i64,
        class: DataClass,
        name: &str,
        raw: &str,
    ) {
        if class == DataClass::Diagnosis {
            self.append_diagnosis(ctx, store, idx, name);
            if self.table.id(name).is_none() {
                // Unlisted diagnosis codes live only in the list.
                return;
            }
        }
        let Some(id) = self.table.id(name) else {
            log::warn!("unknown variable {name:?}, dropping assignment");
            return;
        };
        let descriptor = self.table.descriptor(id);
        let value = match descriptor.kind {
            VarKind::Float => parse_number(raw).map(Value::Float),
            VarKind::Int => parse_number(raw).map(|v| Value::Int(v.round() as i64)),
            VarKind::Category => parse_number(raw).map(|v| Value::Int(v.round() as i64)),
            VarKind::Bool => parse_bool(raw)
                .or_else(|| parse_number(raw).map(|v| v != 0.0))
                .map(Value::Bool),
            VarKind::StringList => {
                let mut list = match ctx.latest[id.index()].as_ref() {
                    Some(Value::List(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if !list.iter().any(|item| item == raw) {
                    list.push(raw.to_string());
                }
                Some(Value::List(list))
            }
        };
        let Some(value) = value else {
            log::warn!("unparseable value {raw:?} for {name}, dropping assignment");
            return;
        };
        let value = self.clamped(id, value);
        if name == names::CR {
            if let Some(cr) = value.as_f64() {
                ctx.cr_window.push_back((day, cr));
            }
        }
        self.assign(ctx, store, idx, id, value);
    }

    fn append_diagnosis(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        name: &str,
    ) {
        let Some(id) = self.table.id(names::DIAGNOSES) else {
            return;
        };
        let mut list = match ctx.latest[id.index()].as_ref() {
            Some(Value::List(items)) => items.clone(),
            _ => Vec::new(),
        };
        if list.iter().any(|item| item == name) {
            return;
        }
        list.push(name.to_string());
        self.assign(ctx, store, idx, id, Value::List(list));
    }

    fn apply_outcome_flag(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        name: &str,
        raw: &str,
    ) {
        let Some(id) = self.table.id(name) else {
            log::warn!("unknown outcome flag {name:?}, dropping");
            return;
        };
        let value = match self.table.descriptor(id).kind {
            VarKind::Bool => parse_bool(raw)
                .or_else(|| parse_number(raw).map(|v| v != 0.0))
                .map(Value::Bool),
            _ => parse_number(raw).map(Value::Float),
        };
        let Some(value) = value else {
            log::warn!("unparseable outcome value {raw:?} for {name}, dropping");
            return;
        };
        self.assign(ctx, store, idx, id, value);
    }

    /// Recompute every server-calculated variable from the accumulator.
    /// Causal only: nothing here can see past the current element.
    fn recompute_derived(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        day: i64,
    ) {
        while let Some(&(sample_day, _)) = ctx.cr_window.front() {
            if day - sample_day > BASELINE_WINDOW_DAYS {
                ctx.cr_window.pop_front();
            } else {
                break;
            }
        }
        if let Some(id) = self.table.id(names::BASELINE_CR) {
            let baseline = ctx
                .cr_window
                .iter()
                .map(|&(_, cr)| cr)
                .fold(f64::INFINITY, f64::min);
            if baseline.is_finite() {
                self.assign(ctx, store, idx, id, Value::Float(baseline));
            }
        }

        for derived in DERIVED_TABLE {
            let Some(id) = self.table.id(derived.name) else {
                continue;
            };
            let result = {
                let view = AccumulatorView {
                    table: &self.table,
                    latest: &ctx.latest,
                };
                (derived.compute)(&view)
            };
            if let Some(value) = result {
                self.assign(ctx, store, idx, id, value);
            }
        }
    }

    fn increment(&self, ctx: &mut PatientContext, store: &mut ValueStore, idx: u32, name: &str) {
        let Some(id) = self.table.id(name) else {
            return;
        };
        let current = ctx.latest[id.index()]
            .as_ref()
            .and_then(Value::as_i64)
            .unwrap_or(0);
        self.assign(ctx, store, idx, id, Value::Int(current + 1));
    }

    fn assign_by_name(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        name: &str,
        value: Value,
    ) {
        if let Some(id) = self.table.id(name) {
            self.assign(ctx, store, idx, id, value);
        }
    }

    fn assign(
        &self,
        ctx: &mut PatientContext,
        store: &mut ValueStore,
        idx: u32,
        id: VarId,
        value: Value,
    ) {
        let value = self.clamped(id, value);
        ctx.latest[id.index()] = Some(value.clone());
        store.set(id, idx, value);
    }

    fn clamped(&self, id: VarId, value: Value) -> Value {
        if !self.config.clamp_out_of_range {
            return value;
        }
        let descriptor = self.table.descriptor(id);
        match value {
            Value::Float(v) if v < descriptor.min || v > descriptor.max => {
                log::debug!("clamping {} = {v} into range", descriptor.name);
                Value::Float(descriptor.clamp(v))
            }
            Value::Int(v) if (v as f64) < descriptor.min || (v as f64) > descriptor.max => {
                log::debug!("clamping {} = {v} into range", descriptor.name);
                Value::Int(descriptor.clamp(v as f64).round() as i64)
            }
            other => other,
        }
    }
}
