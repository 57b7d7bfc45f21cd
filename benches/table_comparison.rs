use core::hash::Hasher;
use core::hint::black_box;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use criterion::Throughput;
use drift_hash::HashTable as DriftHashTable;
use drift_hash::TableType;
use hashbrown::hash_table::HashTable as HashbrownHashTable;
use siphasher::sip::SipHasher13;

#[derive(Clone, Debug, PartialEq, Eq)]
struct TestItem {
    key: u64,
    value: u64,
}

impl TestItem {
    fn new(key: u64) -> Self {
        black_box(Self {
            key,
            value: key.wrapping_mul(31),
        })
    }
}

struct ItemTable;

impl TableType for ItemTable {
    type Element = TestItem;
    type Key = u64;
    type Metadata = ();

    fn key(elem: &TestItem) -> &u64 {
        &elem.key
    }

    fn hash_key(&self, key: &u64) -> u64 {
        hash_key(*key)
    }

    fn key_eq(&self, k1: &u64, k2: &u64) -> bool {
        k1 == k2
    }
}

const SIZES: &[usize] = &[1 << 10, 1 << 15, 1 << 19];

fn hash_key(key: u64) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write_u64(key);
    black_box(hasher.finish())
}

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_function(format!("drift_hash/{size}"), |b| {
            b.iter(|| {
                let mut table = DriftHashTable::new(ItemTable);
                for key in 0..*size as u64 {
                    table.add(TestItem::new(key)).unwrap();
                }
                black_box(table)
            });
        });

        group.bench_function(format!("hashbrown/{size}"), |b| {
            b.iter(|| {
                let mut table = HashbrownHashTable::new();
                for key in 0..*size as u64 {
                    table.insert_unique(hash_key(key), TestItem::new(key), |item| {
                        hash_key(item.key)
                    });
                }
                black_box(table)
            });
        });
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        let mut drift = DriftHashTable::new(ItemTable);
        let mut brown = HashbrownHashTable::new();
        for key in 0..*size as u64 {
            drift.add(TestItem::new(key)).unwrap();
            brown.insert_unique(hash_key(key), TestItem::new(key), |item| hash_key(item.key));
        }

        group.bench_function(format!("drift_hash/{size}"), |b| {
            b.iter(|| {
                let mut hits = 0u64;
                for key in 0..*size as u64 {
                    if drift.find(&key).is_some() {
                        hits += 1;
                    }
                }
                black_box(hits)
            });
        });

        group.bench_function(format!("hashbrown/{size}"), |b| {
            b.iter(|| {
                let mut hits = 0u64;
                for key in 0..*size as u64 {
                    if brown.find(hash_key(key), |item| item.key == key).is_some() {
                        hits += 1;
                    }
                }
                black_box(hits)
            });
        });
    }

    group.finish();
}

fn bench_full_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_scan");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        let mut table = DriftHashTable::new(ItemTable);
        for key in 0..*size as u64 {
            table.add(TestItem::new(key)).unwrap();
        }

        group.bench_function(format!("drift_hash/{size}"), |b| {
            b.iter(|| {
                let mut sum = 0u64;
                let mut cursor = 0;
                loop {
                    cursor = table.scan(cursor, |item| sum += item.value);
                    if cursor == 0 {
                        break;
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_lookup_hit,
    bench_full_scan
);
criterion_main!(benches);
