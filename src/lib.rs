//! Streaming compiler for TDF clinical event logs.
//!
//! Ingests per-patient longitudinal event logs in the Timeline Data
//! Format and compiles each record into a dense per-timestep feature
//! timeline: a streaming record locator, a two-pass compiler (forward
//! fill with causal derived values, then reverse-pass future-outcome
//! labeling), and a random-access query layer over the result.
//!
//! # Example
//!
//! ```no_run
//! use timeloom::{
//!     find_patient_records, resolve, ByteRange, MedicationTable, MetadataTable,
//!     PatientReader, TimelineCompiler, TimelineQuery,
//! };
//!
//! let table = MetadataTable::clinical_default();
//! let compiler = TimelineCompiler::new(table.clone(), MedicationTable::clinical_default());
//! let spans = find_patient_records("cohort.tdf", ByteRange::whole_file())?;
//! let mut reader = PatientReader::open("cohort.tdf")?;
//! for span in spans {
//!     let record = reader.read(span)?;
//!     let timeline = compiler.compile_finalized(&record);
//!     let query = TimelineQuery::new(&timeline);
//!     let creatinine = resolve(&table, "Cr[-1].rate7")?;
//!     for index in 0..timeline.len() {
//!         let _ = query.value_at(index, &creatinine);
//!     }
//! }
//! # Ok::<(), timeloom::Error>(())
//! ```

pub mod compile;
pub mod error;
pub mod meta;
pub mod query;
pub mod resolve;
pub mod shard;
pub mod tdf;
pub mod timefunc;
pub mod value;

pub use compile::{
    compute_outcome_category, AdmissionSpan, CompiledTimeline, CompilerConfig, EventRecord,
    Finalized, Forward, PatientSummary, StageTracker, TimelineCompiler, TimelineEntry,
};
pub use error::{Error, Result};
pub use meta::{
    FutureSpec, FutureTarget, MedicationTable, MetadataTable, ProgressionId, ResetRule, VarId,
    VarKind, VariableDescriptor,
};
pub use query::{Criterion, DayValue, TimelineQuery};
pub use resolve::{parse_request_list, parse_request_rows, resolve, VarRef};
pub use shard::{tile, PatientHandler, ShardRunner, ShardStats, WorkerStats};
pub use tdf::{
    find_patient_records, read_head, ByteRange, DataClass, EventClass, PatientHeader,
    PatientLocator, PatientReader, PatientRecord, RawElement, RecordSpan, TdfWriter, Timestamp,
};
pub use timefunc::{TimeFunction, TransformKind};
pub use value::{FutureOutcome, Relation, Value};
