use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use metareg::{
    StudyRecord, compute_derived_stats, fit_mixed_effects_regression, fit_weighted_regression,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_studies(count: usize) -> Vec<StudyRecord> {
    let mut rng = StdRng::seed_from_u64(0x5EED_F64 + count as u64);
    (0..count)
        .map(|_| {
            let treated_total = rng.gen_range(100..20_000);
            let control_total = rng.gen_range(100..20_000);
            StudyRecord::new(
                rng.gen_range(1..treated_total / 10),
                treated_total,
                rng.gen_range(1..control_total / 10),
                control_total,
                rng.gen_range(10.0..60.0),
            )
        })
        .collect()
}

fn benchmark_meta_regression(c: &mut Criterion) {
    let sizes = [13_usize, 1_000, 100_000];
    let inputs: Vec<_> = sizes
        .iter()
        .map(|&size| {
            let studies = random_studies(size);
            let covariates: Vec<f64> = studies.iter().map(|s| s.covariate).collect();
            (size, studies, covariates)
        })
        .collect();

    let mut group = c.benchmark_group("meta_regression");
    for (size, studies, covariates) in inputs.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("fixed_effect", size), studies, |b, input| {
            b.iter(|| {
                let stats = compute_derived_stats(black_box(input)).unwrap();
                black_box(fit_weighted_regression(&stats, covariates).unwrap());
            });
        });

        let stats = compute_derived_stats(studies).unwrap();
        group.bench_with_input(BenchmarkId::new("mixed_effects", size), &stats, |b, input| {
            b.iter(|| {
                black_box(fit_mixed_effects_regression(black_box(input), covariates).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(meta_regression, benchmark_meta_regression);
criterion_main!(meta_regression);
