//! Two-pass timeline compilation.
//!
//! The forward pass builds the entry sequence and causal state; the
//! reverse pass annotates every entry with future-event knowledge. The
//! phase is a type parameter on [`CompiledTimeline`], so a timeline that
//! has not been finalized cannot reach the query layer.

pub mod derived;
pub mod entry;
pub mod forward;
pub mod milestone;
pub mod reverse;
pub mod store;

pub use entry::{EventRecord, TimelineEntry};
pub use forward::{CompilerConfig, TimelineCompiler};
pub use milestone::StageTracker;
pub use reverse::{compute_outcome_category, HORIZON_BUCKETS, NEVER_CATEGORY};
pub use store::ValueStore;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::meta::{MetadataTable, ProgressionId, VarId};
use crate::value::Value;

/// Phase marker: forward pass done, reverse pass pending.
#[derive(Debug)]
pub struct Forward;

/// Phase marker: both passes done, entries immutable.
#[derive(Debug)]
pub struct Finalized;

/// One hospital stay. `discharge` is `None` while the stay is still open
/// at the end of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSpan {
    pub admit: i64,
    pub discharge: Option<i64>,
}

impl AdmissionSpan {
    /// Whether `day` falls inside this stay; an open stay extends to
    /// `open_end`.
    pub fn contains(&self, day: i64, open_end: i64) -> bool {
        day >= self.admit && day <= self.discharge.unwrap_or(open_end)
    }
}

/// Terminal per-patient facts collected by the forward pass; the reverse
/// pass and the query layer read these.
#[derive(Debug, Clone)]
pub struct PatientSummary {
    pub patient_id: String,
    pub gender: String,
    pub race: String,
    pub first_day: Option<i64>,
    pub last_day: Option<i64>,
    pub admissions: Vec<AdmissionSpan>,
    pub death_day: Option<i64>,
    pub kidney: StageTracker,
    pub liver: StageTracker,
}

impl PatientSummary {
    /// Finalized onset date for a staged progression milestone.
    pub fn milestone_onset(&self, progression: ProgressionId, stage: u8) -> Option<i64> {
        match progression {
            ProgressionId::Kidney => self.kidney.onset(stage),
            ProgressionId::Liver => self.liver.onset(stage),
        }
    }

    /// The stay containing `day`, if any.
    pub fn admission_containing(&self, day: i64) -> Option<&AdmissionSpan> {
        let open_end = self.death_day.or(self.last_day).unwrap_or(i64::MAX);
        self.admissions.iter().find(|a| a.contains(day, open_end))
    }
}

/// One patient's compiled timeline, exclusively owned by that patient's
/// compilation. Entries are strictly non-decreasing in (day, interval)
/// and never split after the forward pass merges them.
pub struct CompiledTimeline<P = Finalized> {
    entries: Vec<TimelineEntry>,
    store: ValueStore,
    summary: PatientSummary,
    table: Arc<MetadataTable>,
    carry_forward: bool,
    _phase: PhantomData<P>,
}

impl<P> CompiledTimeline<P> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&TimelineEntry> {
        self.entries.get(index)
    }

    pub fn summary(&self) -> &PatientSummary {
        &self.summary
    }

    pub fn table(&self) -> &Arc<MetadataTable> {
        &self.table
    }

    /// State of a variable as of an entry: carried forward from its most
    /// recent assignment, or only the entry's own assignment when
    /// carry-forward was compiled off.
    pub fn value_at_entry(&self, id: VarId, entry: u32) -> Option<&Value> {
        if self.carry_forward {
            self.store.value_at(id, entry)
        } else {
            self.store.value_set_at(id, entry)
        }
    }

    pub(crate) fn store(&self) -> &ValueStore {
        &self.store
    }
}

impl CompiledTimeline<Forward> {
    pub(crate) fn new_forward(
        entries: Vec<TimelineEntry>,
        store: ValueStore,
        summary: PatientSummary,
        table: Arc<MetadataTable>,
        carry_forward: bool,
    ) -> Self {
        Self {
            entries,
            store,
            summary,
            table,
            carry_forward,
            _phase: PhantomData,
        }
    }

    /// Run the reverse pass. Consumes the forward-phase timeline; the
    /// result is immutable and queryable.
    pub fn finalize(mut self) -> CompiledTimeline<Finalized> {
        reverse::back_propagate(
            &self.entries,
            &mut self.store,
            &self.summary,
            &self.table,
            self.carry_forward,
        );
        CompiledTimeline {
            entries: self.entries,
            store: self.store,
            summary: self.summary,
            table: self.table,
            carry_forward: self.carry_forward,
            _phase: PhantomData,
        }
    }
}
