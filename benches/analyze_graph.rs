//! Graph analysis over a generated snapshot: long dependency chains, each
//! fanning out to a handful of leaf requirements.

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rtm_engine::{
    RequirementId, RequirementRecord, RequirementSet,
    domain::{GraphAnalysis, reciprocity},
};

const FAN_OUT: usize = 4;

fn id(category: &str, number: usize) -> RequirementId {
    format!("REQ-{category}-{number:03}").parse().unwrap()
}

/// `chains` chains of `length` records, each chain link blocking the next
/// and `FAN_OUT` leaves.
fn snapshot(chains: usize, length: usize) -> RequirementSet {
    let mut set = RequirementSet::new();
    for chain in 0..chains {
        let category = format!("C{chain}");
        let leaves = format!("L{chain}");
        for link in 1..=length {
            let mut record = RequirementRecord::new(id(&category, link));
            if link > 1 {
                record = record.depends_on(id(&category, link - 1));
            }
            if link < length {
                record = record.blocking(id(&category, link + 1));
            }
            for leaf in 0..FAN_OUT {
                let leaf_id = id(&leaves, link * FAN_OUT + leaf);
                record = record.blocking(leaf_id.clone());
                set.upsert(RequirementRecord::new(leaf_id).depends_on(id(&category, link)));
            }
            set.upsert(record);
        }
    }
    set
}

fn analyze_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze graph");
    for chains in [1, 10, 50] {
        let set = snapshot(chains, 100);
        group.bench_with_input(BenchmarkId::new("analysis", set.len()), &set, |b, set| {
            b.iter(|| GraphAnalysis::run(set, "effort_weeks"));
        });
        group.bench_with_input(BenchmarkId::new("reciprocity", set.len()), &set, |b, set| {
            b.iter(|| reciprocity::check(set));
        });
    }
    group.finish();
}

criterion_group!(benches, analyze_graph);
criterion_main!(benches);
