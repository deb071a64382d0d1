use std::sync::Arc;

use tempfile::tempdir;

use timeloom::{
    find_patient_records, meta::names, ByteRange, DataClass, EventClass, MedicationTable,
    MetadataTable, PatientHeader, PatientReader, TdfWriter, TimelineCompiler, TimelineQuery,
    Timestamp, Value, VarRef,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compiler() -> (Arc<MetadataTable>, TimelineCompiler) {
    let table = MetadataTable::clinical_default();
    let compiler = TimelineCompiler::new(Arc::clone(&table), MedicationTable::clinical_default());
    (table, compiler)
}

#[test]
fn written_values_read_back_for_every_timestamp() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("cohort.tdf");

    let written: Vec<(i64, f64)> = vec![(1, 1.0), (2, 1.3), (4, 0.9), (9, 2.1)];
    let mut writer = TdfWriter::create(&path).expect("create");
    writer.begin(&["Source=round-trip"]).expect("begin");
    writer
        .begin_patient(&PatientHeader {
            id: "rt-1".to_string(),
            gender: "F".to_string(),
            race: "W".to_string(),
        })
        .expect("patient");
    for &(day, cr) in &written {
        let text = format!("{cr}");
        writer
            .data(
                Timestamp::new(day, 8, 0),
                DataClass::Labs,
                &[("Cr", text.as_str())],
            )
            .expect("data");
    }
    writer.finish().expect("finish");

    let spans = find_patient_records(&path, ByteRange::whole_file()).expect("locate");
    assert_eq!(spans.len(), 1);
    let record = PatientReader::open(&path)
        .expect("reader")
        .read(spans[0])
        .expect("read");

    let (table, compiler) = compiler();
    let timeline = compiler.compile_finalized(&record);
    assert_eq!(timeline.summary().patient_id, "rt-1");
    assert_eq!(timeline.len(), written.len());

    let cr = table.id(names::CR).unwrap();
    for (i, &(day, value)) in written.iter().enumerate() {
        let entry = timeline.entry(i).unwrap();
        assert_eq!(entry.day, day);
        assert_eq!(
            timeline.value_at_entry(cr, i as u32).and_then(Value::as_f64),
            Some(value),
            "creatinine at day {day}"
        );
    }
}

#[test]
fn carry_forward_idempotence_vs_daily_resets() {
    init_logging();
    let (table, compiler) = compiler();
    let record = timeloom::tdf::parse_patient(
        "<Patient id=cf gender=M race=W>\n\
         <D C=L T=05:08:00>Cr=1.2,Na=138</D>\n\
         <E C=Med T=05:10:00 V=40 D=Furosemide />\n\
         <D C=V T=06:09:00>HR=75</D>\n\
         </Patient>\n",
    )
    .expect("parse");
    let timeline = compiler.compile_finalized(&record);

    // Day 6 saw no lab events: always-carried variables repeat day 5.
    let day5 = 0u32;
    let day6 = (timeline.len() - 1) as u32;
    assert_eq!(timeline.entry(day6 as usize).unwrap().day, 6);
    for name in [names::CR, names::NA] {
        let id = table.id(name).unwrap();
        assert_eq!(
            timeline.value_at_entry(id, day5).and_then(Value::as_f64),
            timeline.value_at_entry(id, day6).and_then(Value::as_f64),
            "{name} must carry into day 6"
        );
    }

    // The dose total folded into day 5 resets to unset, not carried.
    let dose = table.id(names::DOSE_FUROSEMIDE).unwrap();
    assert_eq!(
        timeline.value_at_entry(dose, day5).and_then(Value::as_f64),
        Some(40.0)
    );
    assert!(timeline.value_at_entry(dose, day6).is_none());
}

#[test]
fn creatinine_scenario_baseline_aki_and_reverse_correction() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("aki.tdf");

    let mut writer = TdfWriter::create(&path).expect("create");
    writer.begin(&["Source=aki-scenario"]).expect("begin");
    writer
        .begin_patient(&PatientHeader {
            id: "aki-1".to_string(),
            gender: "M".to_string(),
            race: "W".to_string(),
        })
        .expect("patient");
    writer
        .event(Timestamp::new(1, 0, 0), EventClass::Admit, None, None)
        .expect("admit");
    writer
        .data(Timestamp::new(1, 0, 0), DataClass::Labs, &[("Cr", "1.0")])
        .expect("day1");
    writer
        .data(Timestamp::new(3, 0, 0), DataClass::Labs, &[("Cr", "2.9")])
        .expect("day3");
    writer
        .data(Timestamp::new(6, 0, 0), DataClass::Labs, &[("Cr", "1.4")])
        .expect("day6");
    writer
        .event(Timestamp::new(10, 0, 0), EventClass::Discharge, None, None)
        .expect("discharge");
    writer.finish().expect("finish");

    let spans = find_patient_records(&path, ByteRange::whole_file()).expect("locate");
    let record = PatientReader::open(&path)
        .expect("reader")
        .read(spans[0])
        .expect("read");

    let (table, compiler) = compiler();

    // Forward only: day 1's baseline needs no future information.
    let forward = compiler.compile(&record);
    let baseline = table.id(names::BASELINE_CR).unwrap();
    let aki = table.id(names::IN_AKI).unwrap();
    let day1 = 0u32;
    assert_eq!(
        forward.value_at_entry(baseline, day1).and_then(Value::as_f64),
        Some(1.0)
    );

    let timeline = forward.finalize();
    let day3 = timeline
        .entries()
        .iter()
        .position(|e| e.day == 3)
        .unwrap() as u32;

    // 2.9 >= 1.5 x 1.0: in AKI on day 3.
    assert_eq!(
        timeline.value_at_entry(aki, day3).and_then(Value::as_bool),
        Some(true)
    );
    // The reverse pass must not leave day 3's baseline influenced by
    // the transient peak.
    assert_eq!(
        timeline.value_at_entry(baseline, day3).and_then(Value::as_f64),
        Some(1.0)
    );

    assert_eq!(timeline.summary().admissions.len(), 1);
    assert_eq!(timeline.summary().admissions[0].admit, 1);
    assert_eq!(timeline.summary().admissions[0].discharge, Some(10));

    // Offset query: creatinine three days before day 6 is day 3's peak.
    let query = TimelineQuery::new(&timeline);
    let day6 = timeline
        .entries()
        .iter()
        .position(|e| e.day == 6)
        .unwrap();
    let var = VarRef {
        stem: names::CR.to_string(),
        offset: -3,
        transform: None,
    };
    assert_eq!(query.value_at(day6, &var), Some(Value::Float(2.9)));
}
