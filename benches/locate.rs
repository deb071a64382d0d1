use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tempfile::tempdir;

use timeloom::{find_patient_records, ByteRange, DataClass, PatientHeader, TdfWriter, Timestamp};

fn write_cohort(path: &std::path::Path, patients: usize) {
    let mut writer = TdfWriter::create(path).expect("create");
    writer.begin(&["Source=bench"]).expect("begin");
    for i in 0..patients {
        writer
            .begin_patient(&PatientHeader {
                id: format!("p{i}"),
                gender: "M".to_string(),
                race: "W".to_string(),
            })
            .expect("patient");
        for day in 1..=5i64 {
            writer
                .data(
                    Timestamp::new(day, 8, 0),
                    DataClass::Labs,
                    &[("Cr", "1.1"), ("Na", "139")],
                )
                .expect("data");
        }
        writer.end_patient().expect("end");
    }
    writer.finish().expect("finish");
}

fn bench_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("locate");
    for &patients in &[100_usize, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(patients),
            &patients,
            |b, &patients| {
                b.iter_batched(
                    || {
                        let dir = tempdir().expect("tempdir");
                        let path = dir.path().join("cohort.tdf");
                        write_cohort(&path, patients);
                        (dir, path)
                    },
                    |(_dir, path)| {
                        let spans = find_patient_records(&path, ByteRange::whole_file())
                            .expect("locate");
                        assert_eq!(black_box(spans).len(), patients);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_locate);
criterion_main!(benches);
