//! Timeline Data Format: element grammar, record location, emission.

pub mod element;
pub mod locator;
pub mod writer;

pub use element::{
    decode_lenient, parse_patient, DataClass, ElementKind, EventClass, PatientHeader,
    PatientRecord, RawElement, Timestamp,
};
pub use locator::{
    find_patient_records, read_head, ByteRange, HeadInfo, PatientLocator, PatientReader,
    RecordSpan,
};
pub use writer::TdfWriter;
