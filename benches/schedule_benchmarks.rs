//! Lowering throughput over a deep producer chain.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use arrayloom::{environment, lower, Environment, Expr, Producer, ScheduleBuilder, Target};

fn chain_pipeline(depth: usize) -> Environment {
    let x = Expr::var("x");
    let y = Expr::var("y");
    let mut producers = vec![Producer::define("p0", &["x", "y"], vec![x.clone() + y.clone()])];
    for i in 1..depth {
        let prev = format!("p{}", i - 1);
        producers.push(Producer::define(
            format!("p{i}"),
            &["x", "y"],
            vec![Expr::call(prev, vec![x.clone() - 1.into(), y.clone() + 1.into()]) * 2.into()],
        ));
    }
    environment(producers)
}

fn bench_lower_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("lower_chain");
    for depth in [4usize, 16, 32] {
        // Alternate inline and root so both injection paths are exercised.
        let mut env = chain_pipeline(depth);
        for i in (0..depth - 1).step_by(2) {
            ScheduleBuilder::new(format!("p{i}"), 0)
                .compute_root()
                .store_root()
                .apply(&mut env)
                .expect("legal schedule");
        }
        let output = vec![format!("p{}", depth - 1)];

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| lower(&output, &env, &Target::host()).expect("schedulable"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lower_chain);
criterion_main!(benches);
