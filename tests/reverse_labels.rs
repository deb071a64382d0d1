use std::sync::Arc;

use timeloom::{
    compute_outcome_category, meta::names, tdf::parse_patient, CompiledTimeline, Finalized,
    FutureOutcome, MedicationTable, MetadataTable, ProgressionId, TimelineCompiler, Value,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile(block: &str) -> (Arc<MetadataTable>, CompiledTimeline<Finalized>) {
    let table = MetadataTable::clinical_default();
    let compiler = TimelineCompiler::new(Arc::clone(&table), MedicationTable::clinical_default());
    let timeline = compiler.compile_finalized(&parse_patient(block).expect("parse"));
    (table, timeline)
}

fn future_label(
    table: &MetadataTable,
    timeline: &CompiledTimeline<Finalized>,
    name: &str,
    index: u32,
) -> FutureOutcome {
    let id = table.id(name).expect("future variable");
    match timeline.value_at_entry(id, index) {
        Some(Value::Future(outcome)) => *outcome,
        other => panic!("expected a future label for {name}, got {other:?}"),
    }
}

#[test]
fn every_entry_before_the_event_counts_down_to_it() {
    init_logging();
    let event_day = 14i64;
    let (table, timeline) = compile(
        "<Patient id=cd gender=M race=W>\n\
         <D C=L T=01:08:00>Cr=1.0</D>\n\
         <D C=L T=04:08:00>Cr=1.1</D>\n\
         <D C=L T=09:08:00>Cr=1.0</D>\n\
         <E C=Intubation T=14:10:00 />\n\
         <D C=L T=15:08:00>Cr=1.2</D>\n\
         </Patient>\n",
    );

    for (i, entry) in timeline.entries().iter().enumerate() {
        let label = future_label(&table, &timeline, names::FUTURE_INTUBATION, i as u32);
        if entry.day < event_day {
            assert!(label.occurs);
            assert_eq!(label.days_until, Some(event_day - entry.day));
            assert_eq!(
                label.category,
                compute_outcome_category(entry.day, Some(event_day))
            );
        } else if entry.day == event_day {
            assert!(label.occurs);
            assert_eq!(label.days_until, None);
            assert_eq!(label.category, 0);
        } else {
            // Intubation is not terminal: afterwards no occurrence is known.
            assert!(!label.occurs);
        }
    }
}

#[test]
fn terminal_event_reports_now_or_past_from_its_day_onward() {
    init_logging();
    let (table, timeline) = compile(
        "<Patient id=tm gender=F race=B>\n\
         <D C=L T=02:08:00>Cr=1.0</D>\n\
         <D C=L T=05:08:00>Cr=1.3</D>\n\
         <E C=Death T=08:23:00 />\n\
         </Patient>\n",
    );
    let before = future_label(&table, &timeline, names::FUTURE_DEATH, 0);
    assert_eq!(before.days_until, Some(6));
    assert_eq!(before.category, compute_outcome_category(2, Some(8)));

    let at = future_label(&table, &timeline, names::FUTURE_DEATH, 2);
    assert!(at.occurs);
    assert_eq!(at.days_until, None);
    assert_eq!(at.category, 0);
}

#[test]
fn milestone_onset_survives_only_unrecovered_deterioration() {
    init_logging();
    // Stage 4 kidney function on day 5, recovery by day 15, relapse on
    // day 40. The recorded onset must be the later date.
    let (_table, timeline) = compile(
        "<Patient id=ms gender=M race=W>\n\
         <D C=V T=01:07:00>AgeYears=60</D>\n\
         <D C=L T=05:08:00>Cr=4.0</D>\n\
         <D C=L T=15:08:00>Cr=1.0</D>\n\
         <D C=L T=40:08:00>Cr=4.0</D>\n\
         </Patient>\n",
    );
    let summary = timeline.summary();
    assert_eq!(summary.milestone_onset(ProgressionId::Kidney, 4), Some(40));
    // The intermediate recovery keeps the better stage's original date.
    assert_eq!(summary.milestone_onset(ProgressionId::Kidney, 2), Some(5));
}

#[test]
fn milestone_labels_use_the_relapse_date() {
    init_logging();
    let (table, timeline) = compile(
        "<Patient id=ml gender=M race=W>\n\
         <D C=V T=01:07:00>AgeYears=60</D>\n\
         <D C=L T=05:08:00>Cr=4.0</D>\n\
         <D C=L T=15:08:00>Cr=1.0</D>\n\
         <D C=L T=40:08:00>Cr=4.0</D>\n\
         </Patient>\n",
    );
    // From day 15 the only qualifying stage-4 onset is day 40.
    let idx = timeline
        .entries()
        .iter()
        .position(|e| e.day == 15)
        .unwrap() as u32;
    let label = future_label(&table, &timeline, names::FUTURE_KIDNEY_STAGE4, idx);
    assert!(label.occurs);
    assert_eq!(label.days_until, Some(25));
    assert_eq!(label.category, compute_outcome_category(15, Some(40)));
}

#[test]
fn death_bound_to_its_admission_only() {
    init_logging();
    let (table, timeline) = compile(
        "<Patient id=da gender=M race=W>\n\
         <E C=Admit T=01:06:00 />\n\
         <D C=L T=01:08:00>Cr=1.0</D>\n\
         <E C=Discharge T=03:12:00 />\n\
         <D C=L T=30:08:00>Cr=1.1</D>\n\
         <E C=Admit T=45:07:00 />\n\
         <D C=L T=46:08:00>Cr=1.4</D>\n\
         <E C=Death T=48:02:00 />\n\
         </Patient>\n",
    );
    for (i, entry) in timeline.entries().iter().enumerate() {
        let label = future_label(&table, &timeline, names::WILL_DIE_THIS_ADMISSION, i as u32);
        let in_fatal_stay = entry.day >= 45;
        assert_eq!(
            label.occurs, in_fatal_stay,
            "day {} admission-scoped death",
            entry.day
        );
    }
    // FutureDeath, by contrast, counts down from the very first entry.
    let first = future_label(&table, &timeline, names::FUTURE_DEATH, 0);
    assert!(first.occurs);
    assert_eq!(first.days_until, Some(47));
}
