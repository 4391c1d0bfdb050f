use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use flowgraph::checker::check;
use flowgraph::descriptor::{DescriptorRegistry, FlowunitCategory, FlowunitDesc};
use flowgraph::graph::{DeviceBinding, GraphBuilder, RawGraph};

// ── Fixtures ────────────────────────────────────────────────────────────────

fn registry() -> DescriptorRegistry {
    let mut r = DescriptorRegistry::new();
    let stream = |name: &str, ins: &[&str], outs: &[&str]| {
        FlowunitDesc::new(name, ins, outs, FlowunitCategory::Stream)
    };
    r.register(stream("test_0_1", &[], &["Out_1"])).unwrap();
    r.register(stream("test_1_0", &["In_1"], &[])).unwrap();
    r.register(stream("test_1_1", &["In_1"], &["Out_1"])).unwrap();
    r.register(FlowunitDesc::new(
        "condition_1_2",
        &["In_1"],
        &["Out_1", "Out_2"],
        FlowunitCategory::Condition,
    ))
    .unwrap();
    r.register(FlowunitDesc::new(
        "expand_1_1",
        &["In_1"],
        &["Out_1"],
        FlowunitCategory::Expand,
    ))
    .unwrap();
    r.register(FlowunitDesc::new(
        "collapse_1_1",
        &["In_1"],
        &["Out_1"],
        FlowunitCategory::Collapse,
    ))
    .unwrap();
    r
}

/// A plain chain of `len` stream units.
fn linear_chain(registry: &DescriptorRegistry, len: usize) -> RawGraph {
    let mut b = GraphBuilder::new(registry);
    b.add_node("src", "test_0_1", DeviceBinding::cpu()).unwrap();
    let mut prev = "src".to_string();
    for i in 0..len {
        let name = format!("n{i}");
        b.add_node(&name, "test_1_1", DeviceBinding::cpu()).unwrap();
        b.connect(&prev, "Out_1", &name, "In_1").unwrap();
        prev = name;
    }
    b.add_node("sink", "test_1_0", DeviceBinding::cpu()).unwrap();
    b.connect(&prev, "Out_1", "sink", "In_1").unwrap();
    b.build()
}

/// `depth` nested expand/collapse levels with a condition join per level.
fn nested_regions(registry: &DescriptorRegistry, depth: usize) -> RawGraph {
    let mut b = GraphBuilder::new(registry);
    b.add_node("src", "test_0_1", DeviceBinding::cpu()).unwrap();
    let mut prev = "src".to_string();

    let mut expands = Vec::new();
    for i in 0..depth {
        let expand = format!("expand{i}");
        b.add_node(&expand, "expand_1_1", DeviceBinding::cpu()).unwrap();
        b.connect(&prev, "Out_1", &expand, "In_1").unwrap();

        let cond = format!("cond{i}");
        let join = format!("join{i}");
        b.add_node(&cond, "condition_1_2", DeviceBinding::cpu()).unwrap();
        b.add_node(&join, "test_1_1", DeviceBinding::cpu()).unwrap();
        b.connect(&expand, "Out_1", &cond, "In_1").unwrap();
        b.connect(&cond, "Out_1", &join, "In_1").unwrap();
        b.connect(&cond, "Out_2", &join, "In_1").unwrap();

        expands.push(expand);
        prev = join;
    }
    for i in (0..depth).rev() {
        let collapse = format!("collapse{i}");
        b.add_node(&collapse, "collapse_1_1", DeviceBinding::cpu()).unwrap();
        b.connect(&prev, "Out_1", &collapse, "In_1").unwrap();
        prev = collapse;
    }
    b.add_node("sink", "test_1_0", DeviceBinding::cpu()).unwrap();
    b.connect(&prev, "Out_1", "sink", "In_1").unwrap();
    b.build()
}

// ── Benches ─────────────────────────────────────────────────────────────────

fn bench_linear(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("check_linear");
    for len in [16, 128, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, len| {
            b.iter_batched(
                || linear_chain(&registry, *len),
                |graph| black_box(check(graph)).unwrap(),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("check_nested");
    for depth in [4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, depth| {
            b.iter_batched(
                || nested_regions(&registry, *depth),
                |graph| black_box(check(graph)).unwrap(),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_linear, bench_nested);
criterion_main!(benches);
