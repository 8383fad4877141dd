//! Benchmarks for memory retrieval and stage graph scheduling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use inkflow::core::StageStatus;
use inkflow::memory::{MemoryConfig, MemoryFilter, MemoryStore, MemoryWrite};
use inkflow::pipeline::{PipelineBuilder, StageSpec};
use std::collections::BTreeMap;

const KEYWORDS: [&str; 6] = ["harbor", "storm", "keeper", "letter", "lamp", "tide"];

fn populated_store(stages: usize, writes_per_stage: usize) -> MemoryStore {
    let store = MemoryStore::new(MemoryConfig::default());
    for s in 0..stages {
        let writes = (0..writes_per_stage)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let importance = ((s * writes_per_stage + i) % 10) as f64 / 10.0;
                MemoryWrite::new(
                    format!("Fact {i} from stage {s}: the {} rose at dusk", KEYWORDS[i % KEYWORDS.len()]),
                    importance,
                )
                .with_keywords([KEYWORDS[i % KEYWORDS.len()], KEYWORDS[(i + s) % KEYWORDS.len()]])
            })
            .collect();
        store.commit(&format!("stage-{s}"), writes);
        store.advance_step();
    }
    store
}

fn memory_benchmark(c: &mut Criterion) {
    let store = populated_store(20, 25);
    let filter = MemoryFilter::for_keywords(["storm", "keeper"]).excluding_stage("stage-3");

    c.bench_function("memory_query_500_blocks", |b| {
        b.iter(|| black_box(store.query(black_box(&filter), 1_024)))
    });

    c.bench_function("memory_render_500_blocks", |b| {
        let blocks = store.query(&filter, 4_096);
        b.iter(|| black_box(MemoryStore::render(black_box(&blocks))))
    });
}

fn graph_benchmark(c: &mut Criterion) {
    let mut builder = PipelineBuilder::new().stage(StageSpec::new("outline"));
    for i in 0..50 {
        builder = builder.stage(StageSpec::new(format!("chapter-{i}")).with_dependencies(["outline"]));
    }
    let chapters: Vec<String> = (0..50).map(|i| format!("chapter-{i}")).collect();
    builder = builder.stage(StageSpec::new("assemble").with_dependencies(chapters));
    let Ok(graph) = builder.build() else {
        return;
    };

    let mut statuses: BTreeMap<String, StageStatus> = graph
        .stages()
        .iter()
        .map(|s| (s.name.clone(), StageStatus::Pending))
        .collect();
    statuses.insert("outline".to_string(), StageStatus::Completed);

    c.bench_function("graph_ready_fan_out_50", |b| {
        b.iter(|| black_box(graph.ready(black_box(&statuses)).len()))
    });
    c.bench_function("graph_descendants_fan_out_50", |b| {
        b.iter(|| black_box(graph.descendants(black_box("outline")).len()))
    });
}

criterion_group!(benches, memory_benchmark, graph_benchmark);
criterion_main!(benches);
