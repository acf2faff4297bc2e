// Token selection and lock table benchmarks.
//
// Covers a full select + unlock cycle over vaults of various sizes, and raw
// lock/unlock throughput on the lock table.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use tokenflow_protocol::config::SelectorConfig;
use tokenflow_protocol::identity::Identity;
use tokenflow_protocol::selector::{Locker, Selector};
use tokenflow_protocol::storage::{MemoryStatusStore, StatusStore};
use tokenflow_protocol::vault::{TokenId, TokenVault, UnspentToken};

fn vault_with(owner: &Identity, tokens: u64) -> Arc<TokenVault> {
    let vault = Arc::new(TokenVault::new());
    for i in 0..tokens {
        vault
            .add(UnspentToken::new(TokenId::new("genesis", i), owner.clone(), "USD", 10))
            .unwrap();
    }
    vault
}

fn bench_select_unlock(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let owner = Identity::from_bytes(vec![1; 32]);
    let mut group = c.benchmark_group("selector/select_unlock");

    for size in [10u64, 100, 1_000] {
        let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());
        let locker = Arc::new(Locker::new(store, Duration::from_secs(60)));
        let selector = Selector::new(vault_with(&owner, size), locker, SelectorConfig::default());
        // Half of the vault.
        let amount = size * 5;

        group.throughput(Throughput::Elements(size / 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), &amount, |b, amount| {
            b.iter(|| {
                rt.block_on(async {
                    let (ids, _) = selector
                        .select(|o| *o == owner, *amount, "USD", "bench-tx")
                        .await
                        .unwrap();
                    assert_eq!(selector.unlock("bench-tx"), ids.len());
                })
            });
        });
    }
    group.finish();
}

fn bench_lock_table(c: &mut Criterion) {
    let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());
    let locker = Locker::new(store, Duration::from_secs(60));
    let ids: Vec<TokenId> = (0..1_000).map(|i| TokenId::new("genesis", i)).collect();

    c.bench_function("locker/lock_unlock_1000", |b| {
        b.iter(|| {
            for id in &ids {
                locker.lock(id, "tx", false).unwrap();
            }
            locker.unlock_by_tx_id("tx")
        });
    });
}

criterion_group!(benches, bench_select_unlock, bench_lock_table);
criterion_main!(benches);
