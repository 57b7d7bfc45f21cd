//! An open addressing hash table with cache-line sized buckets and
//! incremental rehashing.
//!
//! The table is a power-of-two sized array of 64-byte buckets. Each bucket
//! holds up to [`ELEMENTS_PER_BUCKET`] element slots plus metadata, so a
//! lookup normally touches a single cache line. The metadata carries one
//! presence bit per slot and one truncated hash byte per slot. The hash byte
//! stores the top 8 bits of the element's full 64-bit hash, which are
//! independent of the bits that select the bucket, so comparing it rules out
//! almost all false candidates before the (potentially expensive) key
//! comparison runs.
//!
//! ## The ever-full bit
//!
//! Collisions are resolved by probing to the next bucket, in the same order
//! a scan cursor advances (see below). There are no per-slot tombstones.
//! Instead each bucket has a single sticky "ever-full" bit, set the moment
//! the bucket becomes completely occupied and cleared only when the whole
//! bucket array is discarded after rehashing. The bit means "an insertion
//! may have continued past this bucket". Lookups keep probing while it is
//! set and stop at the first bucket where it is clear. Deletions only clear
//! a presence bit, which keeps them cheap but means probe chains never
//! shrink in place. Chains are compacted as a side effect of rehashing,
//! since the replacement table starts with all ever-full bits clear.
//!
//! ## Incremental rehashing
//!
//! Resizing allocates a second bucket array and migrates one source bucket
//! per step, so the cost of a resize is spread over many operations. While
//! rehashing is in progress both arrays are live. New elements are inserted
//! into the new array and lookups check both, the new array first since it
//! has fewer ever-full buckets. The migration order follows the reverse-bit
//! cursor, which lets a concurrent scan reason about which buckets have
//! moved.
//!
//! A process-wide [`ResizePolicy`] throttles this work. A server that forks
//! a snapshot child sets the policy to `Avoid` so that the parent does not
//! rewrite large amounts of copy-on-write memory. Under `Avoid`, migration
//! steps run only on insertions. With open addressing the table can never
//! be filled past 100%, so expansion must remain possible under every
//! policy. It is also possible for a resize to be demanded while an earlier
//! rehash is still in progress. In that case the earlier rehash is
//! fast-forwarded to completion first, so at most two bucket arrays exist
//! at any time.
//!
//! ## Scan
//!
//! [`HashTable::scan`] implements a stateless iteration protocol. The
//! caller keeps a single cursor integer, initially 0, and repeatedly calls
//! `scan` until it returns 0 again. The cursor is advanced by incrementing
//! its reverse-bit representation. That ordering has the property that the
//! buckets visited under a small mask are exactly the prefixes of the
//! buckets visited under any larger mask, which makes the walk order stable
//! when the table grows or shrinks between calls. Every element present in
//! the table for the whole duration of the scan is emitted at least once.
//! Elements added or removed while the scan is in progress may or may not
//! be emitted, and an element can be emitted twice if a resize splits a
//! bucket mid-scan.
//!
//! Because probing can push an element past its primary bucket, a single
//! scan call covers the entire probe sequence it lands on. The call keeps
//! walking while the bucket it just emitted has the ever-full bit set, so
//! displaced elements cannot be missed when they are rehashed back to their
//! primary bucket between calls.
//!
//! ## Layout
//!
//! 64-bit targets use 7 element slots per bucket:
//!
//! ```text
//! 1 bit     7 bits    [1 byte] x 7  [8 bytes] x 7 = 64 bytes
//! everfull  presence  hashes        elements
//! ```
//!
//! 32-bit targets use 12 slots per bucket with a few spare metadata bits.
//! The bucket is one cache line when elements are pointer-sized. Larger
//! element types work, the bucket simply spans more than one line.
//!
//! ## Safety invariants
//!
//! The implementation relies on the following relationships:
//!
//! 1. **Initialization**: a set presence bit is the witness that the
//!    corresponding element slot is initialized. Slots with a clear bit are
//!    never read. Moving an element out of a slot clears the bit (or, for
//!    bucket migration, clears the whole presence mask before the step
//!    returns).
//! 2. **Index bounds**: bucket indices are produced by masking a hash (or
//!    cursor) with `num_buckets - 1`, and the bucket arrays always hold
//!    exactly `num_buckets` buckets, so slice indexing cannot go out of
//!    bounds.
//! 3. **Reachability**: for every occupied slot, either its bucket is the
//!    element's primary bucket, or every bucket from the primary bucket up
//!    to (but not including) its bucket along the probe walk has the
//!    ever-full bit set.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::hash::Hasher;
use core::mem::MaybeUninit;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;

use cfg_if::cfg_if;
use siphasher::sip::SipHasher13;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Number of element slots per bucket.
        pub const ELEMENTS_PER_BUCKET: usize = 7;
        const BUCKET_FACTOR: usize = 3;
        const BUCKET_DIVISOR: usize = 16;
        type BucketMeta = u8;
    } else {
        /// Number of element slots per bucket.
        pub const ELEMENTS_PER_BUCKET: usize = 12;
        const BUCKET_FACTOR: usize = 7;
        const BUCKET_DIVISOR: usize = 64;
        type BucketMeta = u16;
    }
}

/* Bucket counts are selected without division. The number of buckets needed
 * for `n` elements is ceil(n / (ELEMENTS_PER_BUCKET * fill)), and the fill
 * factor is chosen so this becomes a multiply by BUCKET_FACTOR and a divide
 * by the power-of-two BUCKET_DIVISOR:
 *
 *     num_buckets = ceil(n * BUCKET_FACTOR / BUCKET_DIVISOR)
 *
 * which bounds the post-resize fill at
 * BUCKET_DIVISOR / BUCKET_FACTOR / ELEMENTS_PER_BUCKET (76.19% on 64-bit).
 */

const MAX_FILL_PERCENT_SOFT: usize = 77;
const MAX_FILL_PERCENT_HARD: usize = 90;

const MIN_FILL_PERCENT_SOFT: usize = 13;
const MIN_FILL_PERCENT_HARD: usize = 3;

const _: () = assert!(
    100 * BUCKET_DIVISOR / BUCKET_FACTOR / ELEMENTS_PER_BUCKET <= MAX_FILL_PERCENT_SOFT,
    "a resize must land below the soft max fill factor"
);
const _: () = assert!(MAX_FILL_PERCENT_SOFT <= MAX_FILL_PERCENT_HARD);
const _: () = assert!(MAX_FILL_PERCENT_HARD < 100);

const PRESENCE_MASK: BucketMeta = (1 << ELEMENTS_PER_BUCKET) - 1;
const EVERFULL: BucketMeta = 1 << ELEMENTS_PER_BUCKET;

/* --- Process-wide configuration --- */

/// Process-wide gate for automatic resizing.
///
/// Shared by every table in the process, like the hash seed. It is intended
/// to be changed around a fork and otherwise left alone. The default is
/// [`ResizePolicy::Allow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Rehash as required for optimal performance.
    Allow,
    /// Avoid moving memory when possible. Used while a forked child is
    /// running, so the parent does not dirty copy-on-write pages. Expansion
    /// waits for the hard fill limit, shrinking waits for the hard minimum,
    /// and migration steps run only on insertions.
    Avoid,
    /// Never shrink. Expansion is still permitted, since an open addressing
    /// table cannot be filled past its capacity. Used in a child process
    /// that does not add keys.
    Forbid,
}

static RESIZE_POLICY: AtomicU8 = AtomicU8::new(ResizePolicy::Allow as u8);

static HASH_SEED: [AtomicU8; 16] = [const { AtomicU8::new(0) }; 16];

/// Sets the process-wide resize policy.
pub fn set_resize_policy(policy: ResizePolicy) {
    RESIZE_POLICY.store(policy as u8, Ordering::Relaxed);
}

/// Returns the current process-wide resize policy.
pub fn resize_policy() -> ResizePolicy {
    match RESIZE_POLICY.load(Ordering::Relaxed) {
        0 => ResizePolicy::Allow,
        1 => ResizePolicy::Avoid,
        _ => ResizePolicy::Forbid,
    }
}

/// Seeds the default hash function shared by every table in the process.
///
/// Intended to be called once at startup, before any table is populated.
/// Changing the seed while tables built on [`hash_bytes`] contain elements
/// makes their contents unreachable.
pub fn set_hash_function_seed(seed: [u8; 16]) {
    for (slot, byte) in HASH_SEED.iter().zip(seed) {
        slot.store(byte, Ordering::Relaxed);
    }
}

/// Returns the process-wide hash seed.
pub fn hash_function_seed() -> [u8; 16] {
    core::array::from_fn(|i| HASH_SEED[i].load(Ordering::Relaxed))
}

/// Hashes a byte string with SipHash keyed by the process-wide seed.
///
/// This is the building block for [`TableType::hash_key`] implementations
/// over byte-addressable keys, and the function behind the default identity
/// hash.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let seed = hash_function_seed();
    let k0 = u64::from_le_bytes(seed[..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(seed[8..].try_into().unwrap());
    let mut hasher = SipHasher13::new_with_keys(k0, k1);
    hasher.write(bytes);
    hasher.finish()
}

/* --- Errors --- */

/// Error returned by [`HashTable::try_expand`] when the new bucket array
/// cannot be allocated.
///
/// The table is left in a usable state. Every other allocation in this
/// crate treats failure as fatal and aborts through the global allocation
/// error handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("hash table bucket array allocation failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/* --- Type descriptor --- */

/// The type descriptor parameterizing a [`HashTable`].
///
/// A descriptor is an immutable value carried by the table. It wires in key
/// extraction, hashing, equality, destruction, and the rehashing lifecycle
/// hooks. Implementations are usually zero-sized, but a descriptor may hold
/// state (a case-folding flag, a drop counter) since the hashing and
/// equality methods receive `&self`.
///
/// The element type is whatever handle the caller stores, typically a
/// pointer-sized value such as a `Box` or an index. Using the table as a
/// set is straightforward (`Key = Element`). Using it as a key-value store
/// means combining key and value in one element and extracting the key with
/// [`key`](TableType::key).
pub trait TableType: Sized {
    /// The element handle stored in the table. The table owns its elements.
    type Element;

    /// The key type used for lookups, borrowed out of an element.
    type Key: ?Sized;

    /// Per-table caller data stored inline in the table structure, created
    /// with `Default` by [`HashTable::new`]. Use `()` when not needed.
    type Metadata: Default;

    /// Borrows the lookup key out of an element. For sets, return the
    /// element itself.
    fn key(elem: &Self::Element) -> &Self::Key;

    /// Hashes a key. All 64 bits are used: the low bits select the bucket
    /// and the top 8 bits are stored as the per-slot filter byte.
    ///
    /// The default hashes the key's address with the seeded SipHash, which
    /// gives identity semantics to match the default
    /// [`key_eq`](TableType::key_eq). Override it for by-value keys.
    fn hash_key(&self, key: &Self::Key) -> u64 {
        hash_bytes(&(key as *const Self::Key as *const () as usize).to_ne_bytes())
    }

    /// Compares two keys for equality. Only called when the stored filter
    /// byte already matches, so implementations may be expensive.
    ///
    /// The default is address identity: two keys are equal when they are
    /// the same object in memory.
    fn key_eq(&self, k1: &Self::Key, k2: &Self::Key) -> bool {
        core::ptr::addr_eq(k1 as *const Self::Key, k2 as *const Self::Key)
    }

    /// Destroys an element the table is discarding. Runs on
    /// [`remove`](HashTable::remove), on the overwritten element in
    /// [`replace`](HashTable::replace), and for every element left in a
    /// dropped table. The default drops the element.
    ///
    /// The descriptor, not the table, is in scope here, so the
    /// implementation cannot re-enter table operations.
    fn destroy(&self, elem: Self::Element) {
        drop(elem);
    }

    /// Called when incremental rehashing starts, with the new bucket array
    /// already in place. Useful to move the table onto a "currently
    /// rehashing" list tracked in [`Metadata`](TableType::Metadata) or
    /// elsewhere. Must not add or remove elements, and must not trigger a
    /// resize.
    fn rehashing_started(_table: &mut HashTable<Self>) {}

    /// Called when incremental rehashing is about to complete, before the
    /// old bucket array is freed. Same restrictions as
    /// [`rehashing_started`](TableType::rehashing_started).
    fn rehashing_completed(_table: &mut HashTable<Self>) {}
}

/* --- Bucket --- */

#[repr(C)]
struct Bucket<E> {
    /// Ever-full bit plus one presence bit per slot.
    meta: BucketMeta,
    /// Top 8 bits of each occupied slot's full hash.
    hashes: [u8; ELEMENTS_PER_BUCKET],
    elements: [MaybeUninit<E>; ELEMENTS_PER_BUCKET],
}

impl<E> Bucket<E> {
    fn empty() -> Self {
        Bucket {
            meta: 0,
            hashes: [0; ELEMENTS_PER_BUCKET],
            elements: [const { MaybeUninit::uninit() }; ELEMENTS_PER_BUCKET],
        }
    }

    #[inline(always)]
    fn is_present(&self, pos: usize) -> bool {
        self.meta & (1 << pos) != 0
    }

    #[inline(always)]
    fn set_present(&mut self, pos: usize) {
        self.meta |= 1 << pos;
    }

    #[inline(always)]
    fn clear_present(&mut self, pos: usize) {
        self.meta &= !(1 << pos);
    }

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.meta & PRESENCE_MASK == PRESENCE_MASK
    }

    #[inline(always)]
    fn everfull(&self) -> bool {
        self.meta & EVERFULL != 0
    }

    /// Must be called by every insertion that can fill the bucket. The bit
    /// is sticky for the lifetime of the bucket array.
    #[inline(always)]
    fn mark_everfull_if_full(&mut self) {
        if self.is_full() {
            self.meta |= EVERFULL;
        }
    }

    #[cfg_attr(not(feature = "stats"), allow(dead_code))]
    #[inline(always)]
    fn presence_count(&self) -> usize {
        (self.meta & PRESENCE_MASK).count_ones() as usize
    }
}

fn alloc_buckets<E>(num_buckets: usize) -> Box<[Bucket<E>]> {
    (0..num_buckets).map(|_| Bucket::empty()).collect()
}

fn try_alloc_buckets<E>(num_buckets: usize) -> Result<Box<[Bucket<E>]>, AllocError> {
    let mut buckets = Vec::new();
    buckets.try_reserve_exact(num_buckets).map_err(|_| AllocError)?;
    buckets.extend((0..num_buckets).map(|_| Bucket::empty()));
    Ok(buckets.into_boxed_slice())
}

/* --- Cursor and sizing helpers --- */

/// Advances a scan cursor by incrementing its reverse-bit representation.
/// Unmasked high bits are forced to one before the reversal so the
/// increment carries straight through them, which is what keeps the walk
/// order stable across mask changes. Returning to 0 means a full cycle.
#[inline]
fn next_cursor(mut v: usize, mask: usize) -> usize {
    v |= !mask;
    v = v.reverse_bits();
    v = v.wrapping_add(1);
    v.reverse_bits()
}

/// The inverse of [`next_cursor`].
#[inline]
fn prev_cursor(v: usize, mask: usize) -> usize {
    v.reverse_bits().wrapping_sub(1).reverse_bits() & mask
}

#[inline]
fn num_buckets(exp: i8) -> usize {
    if exp == -1 {
        0
    } else {
        1 << exp
    }
}

/// Bitmask applied to a hash or cursor to get a bucket index.
#[inline]
fn exp_to_mask(exp: i8) -> usize {
    if exp == -1 {
        0
    } else {
        num_buckets(exp) - 1
    }
}

/// Returns the smallest exponent `e` such that `(1 << e)` buckets hold
/// `min_capacity` elements below the soft fill limit. Returns -1 for a
/// capacity of zero.
fn next_bucket_exp(min_capacity: usize) -> i8 {
    if min_capacity == 0 {
        return -1;
    }
    /* ceil(x / y) = floor((x - 1) / y) + 1 */
    let min_buckets = (min_capacity.saturating_mul(BUCKET_FACTOR) - 1) / BUCKET_DIVISOR + 1;
    if min_buckets >= usize::MAX / 2 {
        return (usize::BITS - 1) as i8;
    }
    (usize::BITS - (min_buckets - 1).leading_zeros()) as i8
}

#[inline(always)]
fn high_bits(hash: u64) -> u8 {
    (hash >> 56) as u8
}

/* --- The table --- */

/// An open addressing hash table with cache-line sized buckets, incremental
/// rehashing, and a resize-stable scan.
///
/// The table stores elements of the descriptor's
/// [`Element`](TableType::Element) type and owns them: discarded elements
/// are passed to [`TableType::destroy`], and dropping the table destroys
/// everything left in it. Behavior is parameterized entirely by the
/// [`TableType`] value given to [`new`](HashTable::new).
///
/// All operations run to completion on the calling thread. "Incremental"
/// refers to resize work being amortized across calls, not to any form of
/// internal concurrency.
pub struct HashTable<T: TableType> {
    typ: T,
    /// Slot 0 is the main bucket array, slot 1 the rehashing target.
    tables: [Option<Box<[Bucket<T::Element>]>>; 2],
    /// Number of elements in each bucket array.
    used: [usize; 2],
    /// Exponent for the bucket count (num = 1 << exp). -1 = not allocated.
    bucket_exp: [i8; 2],
    /// Next source bucket to migrate, in reverse-bit order. -1 = rehashing
    /// not in progress.
    rehash_idx: isize,
    /// Non-zero = incremental rehashing is paused.
    pause_rehash: u16,
    /// Non-zero = automatic shrinking is paused.
    pause_shrink: u16,
    metadata: T::Metadata,
}

impl<T: TableType> fmt::Debug for HashTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.len())
            .field("bucket_exp", &self.bucket_exp)
            .field("rehash_idx", &self.rehash_idx)
            .finish_non_exhaustive()
    }
}

impl<T: TableType> HashTable<T> {
    /// Creates an empty table with the given type descriptor.
    ///
    /// No buckets are allocated until the first insertion.
    pub fn new(typ: T) -> Self {
        HashTable {
            typ,
            tables: [None, None],
            used: [0, 0],
            bucket_exp: [-1, -1],
            rehash_idx: -1,
            pause_rehash: 0,
            pause_shrink: 0,
            metadata: T::Metadata::default(),
        }
    }

    /// Returns the table's type descriptor.
    pub fn table_type(&self) -> &T {
        &self.typ
    }

    /// Returns the caller metadata stored in the table.
    pub fn metadata(&self) -> &T::Metadata {
        &self.metadata
    }

    /// Returns the caller metadata stored in the table, mutably.
    pub fn metadata_mut(&mut self) -> &mut T::Metadata {
        &mut self.metadata
    }

    /// Returns the number of elements stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.used[0] + self.used[1]
    }

    /// Returns `true` if the table contains no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of element slots in the bucket array insertions
    /// currently go to.
    pub fn capacity(&self) -> usize {
        let exp = self.bucket_exp[if self.is_rehashing() { 1 } else { 0 }];
        num_buckets(exp) * ELEMENTS_PER_BUCKET
    }

    /// Returns `true` if incremental rehashing is in progress.
    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// Returns `true` if incremental rehashing is paused.
    #[inline]
    pub fn is_rehashing_paused(&self) -> bool {
        self.pause_rehash > 0
    }

    /// Pauses incremental rehashing. Nestable.
    ///
    /// While paused, no migration steps run and bucket arrays stay where
    /// they are. A resize can still be triggered; insertions then go to the
    /// new array while the old one is left untouched, which is how a
    /// fork-aware caller avoids dirtying copy-on-write memory.
    pub fn pause_rehashing(&mut self) {
        self.pause_rehash += 1;
    }

    /// Resumes incremental rehashing after [`pause_rehashing`][p].
    ///
    /// [p]: HashTable::pause_rehashing
    pub fn resume_rehashing(&mut self) {
        debug_assert!(self.pause_rehash > 0);
        self.pause_rehash -= 1;
    }

    /// Pauses automatic shrinking. Nestable. Call before deleting many
    /// elements to avoid triggering a shrink for every batch deleted.
    pub fn pause_auto_shrink(&mut self) {
        self.pause_shrink += 1;
    }

    /// Resumes automatic shrinking. The final resume checks whether the
    /// table should shrink now.
    pub fn resume_auto_shrink(&mut self) {
        debug_assert!(self.pause_shrink > 0);
        self.pause_shrink -= 1;
        if self.pause_shrink == 0 {
            self.shrink_if_needed();
        }
    }

    /// Looks up an element by key.
    ///
    /// Takes `&mut self` because a lookup may perform one step of
    /// incremental rehashing, depending on the resize policy.
    pub fn find(&mut self, key: &T::Key) -> Option<&T::Element> {
        if self.len() == 0 {
            return None;
        }
        let hash = self.typ.hash_key(key);
        let (table, bucket, pos) = self.find_bucket(hash, key)?;
        // SAFETY: find_bucket only returns occupied slot coordinates, and a
        // set presence bit witnesses an initialized slot.
        Some(unsafe { self.buckets(table)[bucket].elements[pos].assume_init_ref() })
    }

    /// Looks up an element by key, returning a mutable reference.
    ///
    /// The parts of the element that feed [`TableType::key`] and
    /// [`TableType::hash_key`] must not be modified through it.
    pub fn find_mut(&mut self, key: &T::Key) -> Option<&mut T::Element> {
        if self.len() == 0 {
            return None;
        }
        let hash = self.typ.hash_key(key);
        let (table, bucket, pos) = self.find_bucket(hash, key)?;
        // SAFETY: as in find.
        Some(unsafe { self.buckets_mut(table)[bucket].elements[pos].assume_init_mut() })
    }

    /// Adds an element. On success returns `Ok(())` and the table takes
    /// ownership. If an element with an equal key already exists, the new
    /// element is handed back unchanged in the `Err` and nothing is
    /// destroyed.
    pub fn add(&mut self, elem: T::Element) -> Result<(), T::Element> {
        match self.add_or_find(elem) {
            Ok(()) => Ok(()),
            Err((elem, _existing)) => Err(elem),
        }
    }

    /// Adds an element, or surfaces the existing one.
    ///
    /// Like [`add`](HashTable::add), but a duplicate key also yields a
    /// mutable reference to the element already in the table, so callers
    /// can update a value in place without a second lookup. The key part of
    /// the existing element must not be modified through the reference.
    pub fn add_or_find(
        &mut self,
        elem: T::Element,
    ) -> Result<(), (T::Element, &mut T::Element)> {
        let hash = self.hash_element(&elem);
        match self.find_bucket(hash, T::key(&elem)) {
            Some((table, bucket, pos)) => {
                // SAFETY: occupied coordinates from find_bucket.
                let existing =
                    unsafe { self.buckets_mut(table)[bucket].elements[pos].assume_init_mut() };
                Err((elem, existing))
            }
            None => {
                self.insert(hash, elem);
                Ok(())
            }
        }
    }

    /// Adds an element, overwriting any existing element with an equal key.
    ///
    /// Returns `true` if the element was inserted and `false` if it
    /// replaced an existing one. The replaced element is destroyed. An
    /// overwrite reuses the slot, leaving presence and ever-full bits
    /// untouched.
    pub fn replace(&mut self, elem: T::Element) -> bool {
        let hash = self.hash_element(&elem);
        match self.find_bucket(hash, T::key(&elem)) {
            Some((table, bucket, pos)) => {
                let slot = &mut self.buckets_mut(table)[bucket].elements[pos];
                // SAFETY: occupied coordinates from find_bucket. The old
                // element is moved out and the new one written before
                // anything else can observe the slot.
                let old = unsafe { slot.assume_init_read() };
                slot.write(elem);
                self.typ.destroy(old);
                false
            }
            None => {
                self.insert(hash, elem);
                true
            }
        }
    }

    /// Removes the element matching `key` and returns it without running
    /// [`TableType::destroy`].
    ///
    /// May trigger an automatic shrink unless auto-shrink is paused.
    pub fn pop(&mut self, key: &T::Key) -> Option<T::Element> {
        if self.len() == 0 {
            return None;
        }
        let hash = self.typ.hash_key(key);
        let (table, bucket, pos) = self.find_bucket(hash, key)?;
        let b = &mut self.buckets_mut(table)[bucket];
        // SAFETY: occupied coordinates from find_bucket. The presence bit
        // is cleared below, so the element is moved out exactly once. The
        // ever-full bit stays set to keep the probe chain traversable.
        let elem = unsafe { b.elements[pos].assume_init_read() };
        b.clear_present(pos);
        self.used[table] -= 1;
        if self.pause_shrink == 0 {
            self.shrink_if_needed();
        }
        Some(elem)
    }

    /// Removes and destroys the element matching `key`. Returns `true` if
    /// an element was removed.
    ///
    /// May trigger an automatic shrink unless auto-shrink is paused.
    pub fn remove(&mut self, key: &T::Key) -> bool {
        match self.pop(key) {
            Some(elem) => {
                self.typ.destroy(elem);
                true
            }
            None => false,
        }
    }

    /// Expands the table to fit at least `size` elements, spreading the
    /// migration over subsequent operations.
    ///
    /// Returns `false` if `size` is smaller than the current element count,
    /// if the table already has the right size, or if the bucket count
    /// would overflow. If a rehash is already running it is fast-forwarded
    /// to completion first.
    pub fn expand(&mut self, size: usize) -> bool {
        if size < self.len() {
            return false;
        }
        self.resize(size)
    }

    /// Like [`expand`](HashTable::expand), but reports allocation failure
    /// instead of aborting. On `Err` the table keeps its previous bucket
    /// arrays and stays fully usable.
    pub fn try_expand(&mut self, size: usize) -> Result<bool, AllocError> {
        if size < self.len() {
            return Ok(false);
        }
        self.resize_with(size, try_alloc_buckets)
    }

    /// Expands the table if the fill factor calls for it.
    ///
    /// This runs automatically on insertion, less eagerly when the resize
    /// policy is `Avoid`. After restoring the policy to `Allow` a caller
    /// may invoke it directly to apply the stricter limit. Returns `true`
    /// if an expansion was started.
    pub fn expand_if_needed(&mut self) -> bool {
        let min_capacity = self.used[0] + self.used[1] + 1;
        let exp = self.bucket_exp[if self.is_rehashing() { 1 } else { 0 }];
        let current_capacity = num_buckets(exp) * ELEMENTS_PER_BUCKET;
        let max_fill_percent = if resize_policy() == ResizePolicy::Avoid {
            MAX_FILL_PERCENT_HARD
        } else {
            MAX_FILL_PERCENT_SOFT
        };
        if min_capacity * 100 <= current_capacity * max_fill_percent {
            return false;
        }
        self.resize(min_capacity)
    }

    /// Shrinks the table if the fill factor calls for it.
    ///
    /// This runs automatically on deletion unless auto-shrink is paused.
    /// Shrinking never interrupts a rehash in progress and never happens
    /// under the `Forbid` policy. Returns `true` if a shrink was started.
    pub fn shrink_if_needed(&mut self) -> bool {
        if self.is_rehashing() || resize_policy() == ResizePolicy::Forbid {
            return false;
        }
        let current_capacity = num_buckets(self.bucket_exp[0]) * ELEMENTS_PER_BUCKET;
        let min_fill_percent = if resize_policy() == ResizePolicy::Avoid {
            MIN_FILL_PERCENT_HARD
        } else {
            MIN_FILL_PERCENT_SOFT
        };
        if self.used[0] * 100 > current_capacity * min_fill_percent {
            return false;
        }
        self.resize(self.used[0])
    }

    /// Scans the table, emitting elements by reference.
    ///
    /// Starts with a cursor of 0. Each call emits the elements of one probe
    /// sequence worth of buckets to `f` and returns the next cursor. The
    /// scan is complete when 0 is returned. The cursor is stateless: the
    /// caller may add, remove, and look up elements between calls, and the
    /// table may resize, without invalidating it.
    ///
    /// Every element present in the table from the first call to the last
    /// is emitted at least once. Elements added or removed mid-scan may or
    /// may not be emitted. An element can be emitted more than once only if
    /// a resize splits buckets while the scan is in progress.
    pub fn scan(&mut self, cursor: usize, mut f: impl FnMut(&T::Element)) -> usize {
        self.scan_mut(cursor, |elem| f(elem))
    }

    /// Scans the table, emitting elements by mutable reference so the
    /// callback can rewrite them in place.
    ///
    /// Same protocol and guarantees as [`scan`](HashTable::scan). The slot
    /// reference is valid only for the callback invocation. The callback
    /// must not modify the parts of the element that feed
    /// [`TableType::key`] and [`TableType::hash_key`].
    pub fn scan_mut(&mut self, mut cursor: usize, mut f: impl FnMut(&mut T::Element)) -> usize {
        if self.len() == 0 {
            return 0;
        }

        /* Keep the bucket arrays in place while the callback may hold slot
         * references. */
        self.pause_rehashing();

        /* If any element hashing to the cursor's bucket may have been
         * pushed onward by probing, the whole probe sequence is covered in
         * this same call. Otherwise a displaced element could be missed
         * when rehashing moves it back to its primary bucket before the
         * next call. */
        loop {
            let mut in_probe_sequence = false;

            if !self.is_rehashing() {
                let mask = exp_to_mask(self.bucket_exp[0]);
                let b = &mut self.buckets_mut(0)[cursor & mask];
                emit_bucket(b, &mut f);
                in_probe_sequence |= b.everfull();
                cursor = next_cursor(cursor, mask);
            } else {
                /* Two bucket arrays are live. Emit the cursor's bucket in
                 * the smaller one, then every bucket in the larger one that
                 * is an expansion of it under the larger mask. */
                let (small, large) = if self.bucket_exp[0] <= self.bucket_exp[1] {
                    (0, 1)
                } else {
                    (1, 0)
                };
                let mask_small = exp_to_mask(self.bucket_exp[small]);
                let mask_large = exp_to_mask(self.bucket_exp[large]);

                let b = &mut self.buckets_mut(small)[cursor & mask_small];
                emit_bucket(b, &mut f);
                in_probe_sequence |= b.everfull();

                loop {
                    let b = &mut self.buckets_mut(large)[cursor & mask_large];
                    emit_bucket(b, &mut f);
                    in_probe_sequence |= b.everfull();

                    /* Increment the bits of the cursor not covered by the
                     * smaller mask. */
                    cursor = next_cursor(cursor, mask_large);
                    if cursor & (mask_small ^ mask_large) == 0 {
                        break;
                    }
                }
            }

            if !in_probe_sequence {
                break;
            }
        }

        self.resume_rehashing();

        cursor
    }

    /* --- Internals --- */

    #[inline]
    fn buckets(&self, table: usize) -> &[Bucket<T::Element>] {
        self.tables[table].as_deref().unwrap_or(&[])
    }

    #[inline]
    fn buckets_mut(&mut self, table: usize) -> &mut [Bucket<T::Element>] {
        self.tables[table].as_deref_mut().unwrap_or(&mut [])
    }

    #[inline]
    fn hash_element(&self, elem: &T::Element) -> u64 {
        self.typ.hash_key(T::key(elem))
    }

    fn reset_table(&mut self, table: usize) {
        self.tables[table] = None;
        self.used[table] = 0;
        self.bucket_exp[table] = -1;
    }

    /// Locates the element matching `key`. Returns the table index, bucket
    /// index, and slot of the match, or `None` if absent from both tables.
    fn find_bucket(&mut self, hash: u64, key: &T::Key) -> Option<(usize, usize, usize)> {
        if self.len() == 0 {
            return None;
        }
        let h2 = high_bits(hash);

        /* Do some incremental rehashing. */
        if self.is_rehashing()
            && !self.is_rehashing_paused()
            && resize_policy() == ResizePolicy::Allow
        {
            self.rehash_step();
        }

        /* Check the rehashing destination table first. It is newer, so it
         * has fewer ever-full buckets and needs less probing. */
        for table in (0..2).rev() {
            if self.used[table] == 0 {
                continue;
            }
            let mask = exp_to_mask(self.bucket_exp[table]);
            let mut bucket_idx = (hash as usize) & mask;
            loop {
                let b = &self.buckets(table)[bucket_idx];
                for pos in 0..ELEMENTS_PER_BUCKET {
                    if b.is_present(pos) && b.hashes[pos] == h2 {
                        /* Candidate. */
                        // SAFETY: presence bit set, so the slot is
                        // initialized.
                        let elem = unsafe { b.elements[pos].assume_init_ref() };
                        if self.typ.key_eq(key, T::key(elem)) {
                            return Some((table, bucket_idx, pos));
                        }
                    }
                }

                /* Probe the next bucket? */
                if !b.everfull() {
                    break;
                }
                bucket_idx = next_cursor(bucket_idx, mask);
            }
        }
        None
    }

    /// Finds a free slot for an element with the given hash. Returns the
    /// destination table index, bucket index, and slot. The destination is
    /// the new table while rehashing is in progress.
    ///
    /// Termination relies on the fill limits: a resize always runs before a
    /// bucket array can reach 100% occupancy, so the probe walk must reach
    /// a bucket with a free slot.
    fn find_bucket_for_insert(&mut self, hash: u64) -> (usize, usize, usize) {
        let table = if self.is_rehashing() { 1 } else { 0 };
        debug_assert!(self.tables[table].is_some());
        let mask = exp_to_mask(self.bucket_exp[table]);
        let mut bucket_idx = (hash as usize) & mask;
        loop {
            let b = &self.buckets(table)[bucket_idx];
            for pos in 0..ELEMENTS_PER_BUCKET {
                if !b.is_present(pos) {
                    return (table, bucket_idx, pos);
                }
            }
            bucket_idx = next_cursor(bucket_idx, mask);
        }
    }

    /// Inserts an element known not to be present. The caller has already
    /// checked for duplicates.
    fn insert(&mut self, hash: u64, elem: T::Element) {
        self.expand_if_needed();
        /* Under the Avoid policy lookups skip rehash steps, so take one
         * here. Insertions must keep rehashing moving or the table could
         * need a second resize before the first one finishes. */
        if self.is_rehashing()
            && !self.is_rehashing_paused()
            && resize_policy() == ResizePolicy::Avoid
        {
            self.rehash_step();
        }
        let (table, bucket_idx, pos) = self.find_bucket_for_insert(hash);
        let b = &mut self.buckets_mut(table)[bucket_idx];
        b.elements[pos].write(elem);
        b.hashes[pos] = high_bits(hash);
        b.set_present(pos);
        b.mark_everfull_if_full();
        self.used[table] += 1;
    }

    /// Migrates one source bucket into the new bucket array.
    fn rehash_step(&mut self) {
        debug_assert!(self.is_rehashing());
        let idx = self.rehash_idx as usize;
        let old_mask = exp_to_mask(self.bucket_exp[0]);

        /* When shrinking, the destination bucket is just the source index
         * masked down, as long as probing never pushed these elements off
         * their primary bucket. That is known from the previous bucket in
         * walk order: if it was never full, no chain extends into this one,
         * and the hash does not need to be recomputed. */
        let reuse_index_as_hash = self.bucket_exp[1] < self.bucket_exp[0]
            && !self.buckets(0)[prev_cursor(idx, old_mask)].everfull();

        for pos in 0..ELEMENTS_PER_BUCKET {
            let src = &self.buckets(0)[idx];
            if !src.is_present(pos) {
                continue;
            }
            let h2 = src.hashes[pos];
            // SAFETY: presence bit set, so the slot is initialized. The
            // whole presence mask of this bucket is cleared after the loop,
            // so each element is moved out exactly once.
            let elem = unsafe { src.elements[pos].assume_init_read() };
            let hash = if reuse_index_as_hash {
                idx as u64
            } else {
                self.hash_element(&elem)
            };
            let (dst_table, dst_idx, dst_pos) = self.find_bucket_for_insert(hash);
            debug_assert_eq!(dst_table, 1);
            let dst = &mut self.buckets_mut(1)[dst_idx];
            dst.elements[dst_pos].write(elem);
            /* The stored hash byte comes from the same full hash, so it
             * moves over unchanged. */
            dst.hashes[dst_pos] = h2;
            dst.set_present(dst_pos);
            dst.mark_everfull_if_full();
            self.used[0] -= 1;
            self.used[1] += 1;
        }

        /* Mark the source bucket as empty. Its ever-full bit no longer
         * matters, the array is freed when the rehash completes. */
        self.buckets_mut(0)[idx].meta &= !PRESENCE_MASK;

        self.rehash_idx = next_cursor(idx, old_mask) as isize;
        if self.rehash_idx == 0 {
            self.rehash_complete();
        }
    }

    /// Swaps the new bucket array into place and frees the old one.
    fn rehash_complete(&mut self) {
        T::rehashing_completed(self);
        self.tables[0] = self.tables[1].take();
        self.bucket_exp[0] = self.bucket_exp[1];
        self.used[0] = self.used[1];
        self.reset_table(1);
        self.rehash_idx = -1;
    }

    fn resize(&mut self, min_capacity: usize) -> bool {
        match self.resize_with(min_capacity, |num| Ok(alloc_buckets(num))) {
            Ok(resized) => resized,
            /* The infallible allocator aborts instead of failing. */
            Err(AllocError) => false,
        }
    }

    /// Allocates a new bucket array and initiates incremental rehashing
    /// into it. Returns `Ok(false)` when no resize is possible (same size,
    /// or the bucket count would overflow).
    fn resize_with(
        &mut self,
        min_capacity: usize,
        alloc: impl FnOnce(usize) -> Result<Box<[Bucket<T::Element>]>, AllocError>,
    ) -> Result<bool, AllocError> {
        /* Size of the new table. */
        let exp = next_bucket_exp(min_capacity);
        let buckets = num_buckets(exp);
        let Some(new_capacity) = buckets.checked_mul(ELEMENTS_PER_BUCKET) else {
            return Ok(false);
        };
        if new_capacity < min_capacity
            || buckets
                .checked_mul(core::mem::size_of::<Bucket<T::Element>>())
                .is_none()
        {
            /* Overflow. */
            return Ok(false);
        }
        let old_exp = self.bucket_exp[if self.is_rehashing() { 1 } else { 0 }];
        if exp == old_exp {
            /* Can't resize to the same size. */
            return Ok(false);
        }

        /* Only one rehash can be in flight. Fast-forward an ongoing one
         * before continuing, so at most one pair of bucket arrays exists. */
        while self.is_rehashing() {
            self.rehash_step();
        }

        let new_table = alloc(buckets)?;
        self.bucket_exp[1] = exp;
        self.tables[1] = Some(new_table);
        self.used[1] = 0;
        self.rehash_idx = 0;
        T::rehashing_started(self);

        /* If the old table is empty there is nothing to migrate. */
        if self.tables[0].is_none() || self.used[0] == 0 {
            self.rehash_complete();
        }
        Ok(true)
    }
}

fn emit_bucket<E>(b: &mut Bucket<E>, f: &mut impl FnMut(&mut E)) {
    for pos in 0..ELEMENTS_PER_BUCKET {
        if b.is_present(pos) {
            // SAFETY: presence bit set, so the slot is initialized.
            f(unsafe { b.elements[pos].assume_init_mut() });
        }
    }
}

impl<T: TableType> Drop for HashTable<T> {
    fn drop(&mut self) {
        for table in 0..2 {
            let Some(mut buckets) = self.tables[table].take() else {
                continue;
            };
            for b in buckets.iter_mut() {
                for pos in 0..ELEMENTS_PER_BUCKET {
                    if b.is_present(pos) {
                        // SAFETY: presence bit set, so the slot is
                        // initialized. The bucket array is freed right
                        // after without touching the slots again.
                        let elem = unsafe { b.elements[pos].assume_init_read() };
                        self.typ.destroy(elem);
                    }
                }
            }
        }
    }
}

/* --- Debug introspection --- */

#[cfg(feature = "stats")]
impl<T: TableType> HashTable<T> {
    /// Prints every bucket of both tables with slot details.
    #[cfg(feature = "std")]
    pub fn dump(&self)
    where
        T::Element: fmt::Debug,
    {
        for table in 0..2 {
            println!(
                "table {}, used {}, exp {}",
                table, self.used[table], self.bucket_exp[table]
            );
            for (idx, b) in self.buckets(table).iter().enumerate() {
                println!("bucket {}:{} everfull:{}", table, idx, b.everfull());
                for pos in 0..ELEMENTS_PER_BUCKET {
                    if b.is_present(pos) {
                        // SAFETY: presence bit set, so the slot is
                        // initialized.
                        let elem = unsafe { b.elements[pos].assume_init_ref() };
                        println!("  {} h2 {:02x} {:?}", pos, b.hashes[pos], elem);
                    } else {
                        println!("  {} (empty)", pos);
                    }
                }
            }
        }
    }

    /// Renders a one-character-per-bucket occupancy histogram. Digits count
    /// the occupied slots, `X` marks an emptied bucket that was once full.
    /// The two tables are separated by a space.
    pub fn histogram(&self) -> alloc::string::String {
        let mut out = alloc::string::String::new();
        for table in 0..2 {
            for b in self.buckets(table) {
                let c = if b.presence_count() == 0 && b.everfull() {
                    'X'
                } else {
                    char::from_digit(b.presence_count() as u32, 16).unwrap_or('?')
                };
                out.push(c);
            }
            if table == 0 {
                out.push(' ');
            }
        }
        out
    }

    /// Returns the length of the longest run of ever-full buckets in either
    /// table, an upper bound on the probing any lookup can do.
    pub fn longest_probing_chain(&self) -> usize {
        let mut maxlen = 0;
        for table in 0..2 {
            if self.bucket_exp[table] < 0 {
                continue;
            }
            let mask = exp_to_mask(self.bucket_exp[table]);
            let mut cursor = 0;
            let mut chainlen = 0;
            loop {
                if self.buckets(table)[cursor].everfull() {
                    chainlen += 1;
                    maxlen = maxlen.max(chainlen);
                } else {
                    chainlen = 0;
                }
                cursor = next_cursor(cursor, mask);
                if cursor == 0 {
                    break;
                }
            }
        }
        maxlen
    }
}
