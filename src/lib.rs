#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod hash_table;

pub use hash_table::hash_bytes;
pub use hash_table::hash_function_seed;
pub use hash_table::resize_policy;
pub use hash_table::set_hash_function_seed;
pub use hash_table::set_resize_policy;
pub use hash_table::AllocError;
pub use hash_table::HashTable;
pub use hash_table::ResizePolicy;
pub use hash_table::TableType;
pub use hash_table::ELEMENTS_PER_BUCKET;
