use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lend_core::index_engine;
use lend_core::rate_model;
use lend_core::ray_math::{accrue_linear, mul_div, ray_div, ray_mul, RAY, U256};
use lend_core::reserve::{Reserve, ReserveParams};
use lend_core::Rounding;

fn test_params() -> ReserveParams {
    ReserveParams {
        reserve_factor: *RAY / U256::from(10u64),
        ltv: *RAY * U256::from(75u64) / U256::from(100u64),
        liquidation_threshold: *RAY * U256::from(80u64) / U256::from(100u64),
        liquidation_bonus: *RAY * U256::from(5u64) / U256::from(100u64),
        base_rate: U256::zero(),
        slope_1: *RAY / U256::from(20u64),
        slope_2: *RAY,
        optimal_utilization: *RAY * U256::from(80u64) / U256::from(100u64),
    }
}

fn ray_math_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ray_math");

    let a = U256::from(123_456_789_012_345u64) * *RAY;
    let b = U256::from(987_654_321u64) * *RAY / U256::from(1_000u64);

    group.bench_function("ray_mul", |bch| {
        bch.iter(|| ray_mul(black_box(a), black_box(b)).unwrap())
    });

    group.bench_function("ray_div", |bch| {
        bch.iter(|| ray_div(black_box(a), black_box(b)).unwrap())
    });

    group.bench_function("mul_div_floor", |bch| {
        bch.iter(|| mul_div(black_box(a), black_box(b), black_box(*RAY), Rounding::Floor).unwrap())
    });

    group.bench_function("mul_div_ceil", |bch| {
        bch.iter(|| mul_div(black_box(a), black_box(b), black_box(*RAY), Rounding::Ceil).unwrap())
    });

    let rate = ray_div(U256::from(5u64), U256::from(100u64)).unwrap()
        / U256::from(lend_core::ray_math::SECONDS_PER_YEAR);
    let dts = vec![1u64, 86_400, 31_536_000];
    for dt in dts {
        group.bench_with_input(BenchmarkId::new("accrue_linear", dt), &dt, |bch, &dt| {
            bch.iter(|| accrue_linear(black_box(*RAY), black_box(rate), black_box(dt)).unwrap())
        });
    }

    group.finish();
}

fn index_engine_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_engine");

    group.bench_function("accrue_one_second_step", |bch| {
        bch.iter_batched(
            || {
                let mut reserve = Reserve::genesis([1u8; 32], test_params(), 0);
                reserve.liquidity_rate = U256::from(1_000_000u64);
                reserve.borrow_rate = U256::from(2_000_000u64);
                reserve
            },
            |mut reserve| index_engine::accrue(&mut reserve, black_box(1)).unwrap(),
            criterion::BatchSize::SmallInput,
        )
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("accrue_then_recalc_full_pass", |bch| {
        bch.iter_batched(
            || {
                let mut reserve = Reserve::genesis([2u8; 32], test_params(), 0);
                reserve.total_liquidity = 10_000_000;
                reserve.total_borrowed = 6_000_000;
                reserve
            },
            |mut reserve| {
                index_engine::accrue(&mut reserve, black_box(86_400)).unwrap();
                let (liquidity_rate, borrow_rate) = rate_model::recalc(&reserve).unwrap();
                reserve.liquidity_rate = liquidity_rate;
                reserve.borrow_rate = borrow_rate;
                reserve
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn rate_model_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_model");

    let utilizations = vec![0u64, 50, 80, 95, 100];
    for pct in utilizations {
        let mut reserve = Reserve::genesis([3u8; 32], test_params(), 0);
        reserve.total_liquidity = 1_000_000;
        reserve.total_borrowed = pct * 10_000;

        group.bench_with_input(BenchmarkId::new("recalc", pct), &reserve, |bch, reserve| {
            bch.iter(|| rate_model::recalc(black_box(reserve)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    ray_math_benchmarks,
    index_engine_benchmarks,
    rate_model_benchmarks
);
criterion_main!(benches);
