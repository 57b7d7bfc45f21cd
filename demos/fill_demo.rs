use clap::Parser;
use drift_hash::hash_bytes;
use drift_hash::HashTable;
use drift_hash::TableType;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,
}

struct U64Table;

impl TableType for U64Table {
    type Element = u64;
    type Key = u64;
    type Metadata = ();

    fn key(elem: &u64) -> &u64 {
        elem
    }

    fn hash_key(&self, key: &u64) -> u64 {
        hash_bytes(&key.to_le_bytes())
    }

    fn key_eq(&self, k1: &u64, k2: &u64) -> bool {
        k1 == k2
    }
}

fn main() {
    let args = Args::parse();

    println!(
        "Creating a table and filling it with {} values...",
        args.target_capacity
    );

    let mut table = HashTable::new(U64Table);
    for value in 0..args.target_capacity as u64 {
        if table.add(value).is_err() {
            eprintln!("unexpected duplicate for {value}");
        }
    }

    println!("Elements: {}", table.len());
    println!("Capacity: {}", table.capacity());
    println!("Rehashing: {}", table.is_rehashing());
    println!("Longest probing chain: {}", table.longest_probing_chain());
    println!("Occupancy: {}", table.histogram());

    println!("Deleting every other element...");
    for value in (0..args.target_capacity as u64).step_by(2) {
        table.remove(&value);
    }

    println!("Elements: {}", table.len());
    println!("Capacity: {}", table.capacity());
    println!("Occupancy: {}", table.histogram());

    println!("Scanning the remainder...");
    let mut emitted = 0usize;
    let mut cursor = 0;
    loop {
        cursor = table.scan(cursor, |_| emitted += 1);
        if cursor == 0 {
            break;
        }
    }
    println!("Scan emitted {emitted} elements");
}
