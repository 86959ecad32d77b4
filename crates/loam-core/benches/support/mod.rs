#![allow(dead_code)]

use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::oid::{Oid, create_oid};
use loam_core::operation::{Operation, Patch, object_ref};
use loam_core::store::{MemoryStore, Storage, WriteBatch};
use serde_json::json;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct BenchmarkTier {
    pub name: &'static str,
    pub document_count: usize,
    pub operation_count: usize,
}

pub const TIER_S: BenchmarkTier = BenchmarkTier {
    name: "S",
    document_count: 100,
    operation_count: 10_000,
};

pub const TIER_M: BenchmarkTier = BenchmarkTier {
    name: "M",
    document_count: 1_000,
    operation_count: 100_000,
};

pub const TIERS: [BenchmarkTier; 2] = [TIER_S, TIER_M];

/// Replicas that author the synthetic history.
pub const REPLICAS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

#[derive(Clone, Copy, Debug)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

#[derive(Clone, Copy, Debug)]
struct Prng(u64);

impl Prng {
    const fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        // 64-bit LCG constants from Numerical Recipes.
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0
    }

    fn next_index(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() as usize) % upper_exclusive
    }
}

/// A deterministic multi-replica history over `todos` documents, each with
/// a `tags` child list.
#[derive(Debug)]
pub struct SyntheticHistory {
    pub tier: BenchmarkTier,
    pub documents: Vec<Oid>,
    pub operations: Vec<Operation>,
}

impl SyntheticHistory {
    /// Operations touching one OID, in generation order.
    pub fn operations_for(&self, oid: &Oid) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| &op.oid == oid)
            .cloned()
            .collect()
    }

    /// The timestamp `fraction` of the way through the history.
    pub fn cutoff(&self, fraction: f64) -> Timestamp {
        let mut stamps: Vec<&Timestamp> = self.operations.iter().map(|op| &op.timestamp).collect();
        stamps.sort();
        let idx = ((stamps.len() - 1) as f64 * fraction) as usize;
        stamps[idx].clone()
    }

    pub fn load(&self, store: &dyn Storage) {
        let mut batch = WriteBatch::new();
        for op in &self.operations {
            batch.put_operation(op.clone());
        }
        store.commit(batch).expect("load synthetic history");
    }

    pub fn memory_store(&self) -> MemoryStore {
        let store = MemoryStore::new();
        self.load(&store);
        store
    }
}

pub fn generate_history(tier: BenchmarkTier, seed: u64) -> SyntheticHistory {
    generate_history_with_limit(tier, seed, tier.operation_count)
}

pub fn generate_history_for_bench(tier: BenchmarkTier, seed: u64) -> SyntheticHistory {
    let max_ops = std::env::var("LOAM_BENCH_MAX_OPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(50_000);
    generate_history_with_limit(tier, seed, tier.operation_count.min(max_ops))
}

pub fn generate_history_with_limit(
    tier: BenchmarkTier,
    seed: u64,
    operation_limit: usize,
) -> SyntheticHistory {
    let mut prng = Prng::new(seed);
    let replicas: Vec<ReplicaId> = REPLICAS
        .iter()
        .map(|r| ReplicaId::new(r).expect("replica id"))
        .collect();
    let document_count = tier.document_count.min(operation_limit.max(2) / 2).max(1);

    let mut documents = Vec::with_capacity(document_count);
    let mut operations = Vec::with_capacity(operation_limit);
    let mut wall = 1_700_000_000_000_u64;
    let mut stamp = |prng: &mut Prng| {
        wall += 1 + (prng.next_u64() % 3);
        let replica = &replicas[prng.next_index(replicas.len())];
        Timestamp::new(1, wall, 0, replica).expect("timestamp")
    };

    for index in 0..document_count {
        let doc = create_oid("todos", &format!("doc-{index:05}"), &[]).expect("oid");
        let tags = doc.child("tags").expect("child oid");
        operations.push(Operation::new(
            doc.clone(),
            stamp(&mut prng),
            Patch::Initialize {
                value: json!({"id": format!("doc-{index:05}"), "title": "", "tags": object_ref(&tags)}),
            },
        ));
        operations.push(Operation::new(
            tags,
            stamp(&mut prng),
            Patch::Initialize { value: json!([]) },
        ));
        documents.push(doc);
    }

    while operations.len() < operation_limit {
        let doc = &documents[prng.next_index(documents.len())];
        let n = prng.next_u64() % 100;
        let (oid, data) = match prng.next_index(6) {
            0 | 1 => (
                doc.clone(),
                Patch::Set {
                    name: "title".into(),
                    value: json!(format!("title {n}")),
                },
            ),
            2 => (
                doc.clone(),
                Patch::Set {
                    name: "done".into(),
                    value: json!(n % 2 == 0),
                },
            ),
            3 => (doc.child("tags").expect("child"), Patch::ListPush { value: json!(n) }),
            4 => (
                doc.child("tags").expect("child"),
                Patch::ListInsert {
                    index: prng.next_index(4),
                    value: json!(n),
                },
            ),
            _ => (
                doc.child("tags").expect("child"),
                Patch::ListDelete {
                    index: prng.next_index(4),
                    count: 1,
                },
            ),
        };
        operations.push(Operation::new(oid, stamp(&mut prng), data));
    }

    SyntheticHistory {
        tier,
        documents,
        operations,
    }
}

pub fn sample_latencies(iterations: usize, mut op: impl FnMut()) -> Vec<Duration> {
    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        op();
        samples.push(start.elapsed());
    }
    samples
}

pub fn summarize_latencies(samples: &[Duration]) -> LatencySummary {
    assert!(!samples.is_empty(), "at least one sample is required");

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    LatencySummary {
        p50: percentile(&sorted, 50),
        p95: percentile(&sorted, 95),
        p99: percentile(&sorted, 99),
    }
}

fn percentile(sorted: &[Duration], percentile: usize) -> Duration {
    let idx = ((sorted.len() - 1) * percentile) / 100;
    sorted[idx]
}
