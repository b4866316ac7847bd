use content_flow_engine::flow_state::FlowControlState;
use content_flow_engine::circuit_breaker::CircuitBreaker;
use content_flow_engine::metrics::{FlowMetrics, KpiType};
use content_flow_engine::FlowStage;
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::HashMap;

fn benchmark_transition_recording(c: &mut Criterion) {
    c.bench_function("transition_recording", |b| {
        b.iter(|| {
            let state = FlowControlState::new();
            state.add_transition(FlowStage::AudienceAlign, "bench").unwrap();
            state
                .add_transition(FlowStage::DraftGeneration, "bench")
                .unwrap();
            state
                .add_transition(FlowStage::StyleValidation, "bench")
                .unwrap();
            state.add_transition(FlowStage::QualityCheck, "bench").unwrap();
            state.add_transition(FlowStage::Finalized, "bench").unwrap();
        })
    });
}

fn benchmark_breaker_call(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench");

    c.bench_function("breaker_passthrough_call", |b| {
        b.iter(|| {
            let _ = breaker.call(|| Ok(42u64)).unwrap();
        })
    });
}

fn benchmark_metric_record(c: &mut Criterion) {
    let metrics = FlowMetrics::new();

    c.bench_function("metric_record", |b| {
        b.iter(|| {
            metrics.record(
                KpiType::StageDuration,
                1.25,
                Some("draft_generation"),
                Some("bench-flow"),
                HashMap::new(),
            );
        })
    });
}

fn benchmark_kpi_snapshot(c: &mut Criterion) {
    let metrics = FlowMetrics::new();
    for i in 0..500 {
        metrics.record_stage_completion("bench-flow", "draft_generation", i as f64 / 100.0, true);
    }

    c.bench_function("kpi_snapshot_forced", |b| {
        b.iter(|| {
            let _ = metrics.get_current_kpis(true);
        })
    });
}

criterion_group!(
    benches,
    benchmark_transition_recording,
    benchmark_breaker_call,
    benchmark_metric_record,
    benchmark_kpi_snapshot
);
criterion_main!(benches);
