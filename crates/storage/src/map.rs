//! Durable map: key to row, in a persistent heap
//!
//! # Layout
//!
//! A root slot of the heap points at a bucket array; each bucket heads a
//! chain of entries `[key][row][next]`; each entry points at a row container
//! `[count]{[name][value]}*`. Names are interned strings, values and keys
//! are unique strings (see [`layout`](crate::layout)).
//!
//! # Volatile index
//!
//! A `DashMap` from key bytes to the key's entry is rebuilt from the chains
//! when the map is opened. Lookups never walk chains.
//!
//! # Concurrency
//!
//! - Reads take no map lock. They snapshot the row container in one copy;
//!   a value reference is replaced by a single word store, so a reader sees
//!   the old or the new reference of each field. Superseded blocks stay
//!   readable until [`DurableMap::reclaim`].
//! - Bucket chains are guarded by striped locks (insert of a new key,
//!   remove).
//! - A row's fields are mutated under row exclusion, chosen by
//!   [`Discipline`]: a per-row mutex, or a closure run under the index's
//!   write lock for the key's shard.
//! - Lock order: bucket stripe, then row.
//!
//! # Poisoning
//!
//! Once a mutation fails with a fatal error (a failed fence, corruption, a
//! simulated crash) the map refuses every later mutation with
//! [`Error::Durability`].

use crate::config::{Discipline, MapConfig};
use crate::durable_string::{DurableString, Interning};
use crate::field::{Field, IntoRepresentation};
use crate::layout::{
    bucket_word, buckets_len, row_capacity, row_len, row_name_word, row_value_word, BUCKETS,
    ENTRY_KEY, ENTRY_LEN, ENTRY_NEXT, ENTRY_ROW, MAP_ENTRY, ROW, ROW_COUNT,
};
use crate::protocol::{self, UpdateProtocol, GROW, INSERT};
use crate::row::Row;
use dashmap::DashMap;
use nvbench_core::{Error, Result, VolatileString};
use nvbench_pmem::layout::words;
use nvbench_pmem::{BlockHandle, BlockState, FailureAtomicSection, Heap};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Volatile handle of one stored row
struct RowSlot {
    entry: BlockHandle,
    key: BlockHandle,
    lock: Arc<Mutex<()>>,
    live: AtomicBool,
}

impl RowSlot {
    fn new(entry: BlockHandle, key: BlockHandle) -> Self {
        RowSlot {
            entry,
            key,
            lock: Arc::new(Mutex::new(())),
            live: AtomicBool::new(true),
        }
    }
}

/// Snapshot of a row container
struct Container {
    block: BlockHandle,
    capacity: u64,
    pairs: Vec<(u64, u64)>,
}

impl Container {
    fn values(&self) -> impl Iterator<Item = BlockHandle> + '_ {
        self.pairs.iter().map(|&(_, v)| BlockHandle::from_offset(v))
    }
}

/// Values converted for storage, with the blocks the operation owns
struct Staged {
    pairs: Vec<(BlockHandle, BlockHandle)>,
    fresh: Vec<BlockHandle>,
}

impl Staged {
    fn holds_value(&self, h: BlockHandle) -> bool {
        self.pairs.iter().any(|&(_, v)| v == h)
    }
}

/// Row contents after applying field updates to a container
struct Plan {
    pairs: Vec<(u64, u64)>,
    replaced: Vec<usize>,
    retired: Vec<BlockHandle>,
}

impl Plan {
    fn new(old: &Container, updates: &[(BlockHandle, BlockHandle)]) -> Self {
        let mut pairs = old.pairs.clone();
        let mut replaced = Vec::new();
        let mut retired = Vec::new();
        for &(name, value) in updates {
            match pairs.iter().position(|&(n, _)| n == name.offset()) {
                Some(i) => {
                    let previous = pairs[i].1;
                    if previous != value.offset() {
                        pairs[i].1 = value.offset();
                        replaced.push(i);
                        retired.push(BlockHandle::from_offset(previous));
                    }
                }
                None => pairs.push((name.offset(), value.offset())),
            }
        }
        Plan {
            pairs,
            replaced,
            retired,
        }
    }

    fn appended(&self, old: &Container) -> &[(u64, u64)] {
        &self.pairs[old.pairs.len()..]
    }
}

fn missing(key: &[u8]) -> Error {
    Error::not_found(format!("key {}", String::from_utf8_lossy(key)))
}

/// Key to row map in a persistent heap
pub struct DurableMap {
    heap: Arc<Heap>,
    root_slot: usize,
    buckets: BlockHandle,
    bucket_count: u64,
    config: MapConfig,
    index: Arc<DashMap<Box<[u8]>, Arc<RowSlot>>>,
    stripes: Vec<Arc<Mutex<()>>>,
    names: DashMap<BlockHandle, VolatileString>,
    poisoned: AtomicBool,
}

impl DurableMap {
    /// Open the map rooted at `root_slot`, creating it if the slot is empty
    ///
    /// An existing map keeps the bucket count it was created with.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a rejected `config`;
    /// [`Error::Corruption`] if the root does not lead to a consistent map.
    pub fn open(heap: Arc<Heap>, root_slot: usize, config: MapConfig) -> Result<Self> {
        config.validate()?;
        match heap.root(root_slot)? {
            Some(buckets) => Self::recover(heap, root_slot, buckets, config),
            None => Self::create(heap, root_slot, config),
        }
    }

    fn assemble(
        heap: Arc<Heap>,
        root_slot: usize,
        buckets: BlockHandle,
        bucket_count: u64,
        config: MapConfig,
    ) -> Self {
        let stripes = (0..config.lock_stripes)
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        DurableMap {
            heap,
            root_slot,
            buckets,
            bucket_count,
            config,
            index: Arc::new(DashMap::new()),
            stripes,
            names: DashMap::new(),
            poisoned: AtomicBool::new(false),
        }
    }

    fn create(heap: Arc<Heap>, root_slot: usize, config: MapConfig) -> Result<Self> {
        let n = config.buckets;
        let buckets = heap.allocate(BUCKETS, buckets_len(n))?;
        heap.write_word(buckets, 0, n)?;
        heap.flush_block(buckets)?;
        heap.fence()?;
        heap.validate(buckets)?;
        heap.fence()?;
        heap.set_root(root_slot, Some(buckets))?;
        info!(root_slot, buckets = n, "durable map created");
        Ok(Self::assemble(heap, root_slot, buckets, n, config))
    }

    fn recover(
        heap: Arc<Heap>,
        root_slot: usize,
        buckets: BlockHandle,
        config: MapConfig,
    ) -> Result<Self> {
        let header = heap.header(buckets)?;
        if header.klass != BUCKETS {
            return Err(Error::corruption(format!(
                "root slot {} points at klass {}, not a bucket array",
                root_slot, header.klass.0
            )));
        }
        let n = heap.read_word(buckets, 0)?;
        if n == 0 || buckets_len(n) > header.len {
            return Err(Error::corruption(format!(
                "bucket array at {} declares {} buckets",
                buckets.offset(),
                n
            )));
        }
        if n != config.buckets {
            debug!(stored = n, configured = config.buckets, "keeping stored bucket count");
        }
        let map = Self::assemble(heap, root_slot, buckets, n, config);
        for bucket in 0..n {
            let mut cursor = map.heap.read_word(buckets, bucket_word(bucket))?;
            while cursor != 0 {
                let entry = BlockHandle::from_offset(cursor);
                let key_block = BlockHandle::from_offset(map.heap.read_word(entry, ENTRY_KEY)?);
                let key = map.heap.read_payload(key_block)?.into_boxed_slice();
                if map.bucket_of(&key) != bucket {
                    return Err(Error::corruption(format!(
                        "entry {} chained in bucket {} but hashes elsewhere",
                        entry.offset(),
                        bucket
                    )));
                }
                if map
                    .index
                    .insert(key, Arc::new(RowSlot::new(entry, key_block)))
                    .is_some()
                {
                    return Err(Error::corruption(format!(
                        "duplicate key at entry {}",
                        entry.offset()
                    )));
                }
                cursor = map.heap.read_word(entry, ENTRY_NEXT)?;
            }
        }
        info!(root_slot, buckets = n, rows = map.len(), "durable map recovered");
        Ok(map)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Heap holding the map
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Configuration the map was opened with
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Root slot holding the bucket array
    pub fn root_slot(&self) -> usize {
        self.root_slot
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if the map holds no rows
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True if a row is stored under `key`
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Every key, in no particular order
    ///
    /// For tests and snapshots; this is not an ordered scan.
    pub fn keys(&self) -> Vec<VolatileString> {
        self.index
            .iter()
            .map(|e| VolatileString::from(e.key().to_vec()))
            .collect()
    }

    /// True once a fatal error has stopped mutations
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Stop all further mutations
    ///
    /// For callers that hit a fatal error outside the map, such as a failed
    /// section commit.
    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(root_slot = self.root_slot, "durable map poisoned");
        }
    }

    /// Free every invalidated block of the heap
    ///
    /// Call only at a quiescent point: a concurrent reader may still hold a
    /// handle to a superseded value.
    pub fn reclaim(&self) -> Result<usize> {
        self.heap.reclaim()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn bucket_of(&self, key: &[u8]) -> u64 {
        xxh3_64(key) % self.bucket_count
    }

    fn stripe(&self, bucket: u64) -> &Arc<Mutex<()>> {
        &self.stripes[(bucket % self.stripes.len() as u64) as usize]
    }

    fn slot(&self, key: &[u8]) -> Result<Arc<RowSlot>> {
        self.index
            .get(key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| missing(key))
    }

    fn ensure_live(slot: &RowSlot, key: &[u8]) -> Result<()> {
        if slot.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(missing(key))
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::durability(
                "map poisoned by an earlier fatal failure",
            ));
        }
        Ok(())
    }

    fn observe<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(op, error = %e, "fatal durable map failure");
                self.poison();
            }
        }
        result
    }

    /// Sections exclude other writers through the row and stripe mutexes,
    /// which the compute discipline's writers never take.
    fn check_section(&self, section: &FailureAtomicSection<'_>) -> Result<()> {
        if !std::ptr::eq(section.heap(), &*self.heap) {
            return Err(Error::invalid_config(
                "failure-atomic section belongs to another heap",
            ));
        }
        if self.config.discipline != Discipline::RowLock {
            return Err(Error::invalid_config(format!(
                "failure-atomic sections need the row-lock discipline, map uses {}",
                self.config.discipline
            )));
        }
        Ok(())
    }

    /// Run `f` with exclusive access to the row stored under `key`
    fn with_row_exclusive<T, F>(&self, key: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&RowSlot) -> Result<T>,
    {
        match self.config.discipline {
            Discipline::RowLock => {
                let slot = self.slot(key)?;
                let _row = slot.lock.lock();
                Self::ensure_live(&slot, key)?;
                f(&slot)
            }
            Discipline::Compute => {
                let guard = self.index.get_mut(key).ok_or_else(|| missing(key))?;
                let slot: &RowSlot = guard.value().as_ref();
                Self::ensure_live(slot, key)?;
                f(slot)
            }
        }
    }

    fn load_container(&self, entry: BlockHandle) -> Result<Container> {
        let block = BlockHandle::from_offset(self.heap.read_word(entry, ENTRY_ROW)?);
        let payload = self.heap.read_payload(block)?;
        let capacity = row_capacity(payload.len() as u64);
        let all: Vec<u64> = words(&payload).collect();
        let count = all.first().copied().unwrap_or(0);
        if count > capacity {
            return Err(Error::corruption(format!(
                "row container {} holds {} of {} slots",
                block.offset(),
                count,
                capacity
            )));
        }
        let pairs = (0..count)
            .map(|i| {
                (
                    all[row_name_word(i) as usize],
                    all[row_value_word(i) as usize],
                )
            })
            .collect();
        Ok(Container {
            block,
            capacity,
            pairs,
        })
    }

    fn name_of(&self, h: BlockHandle) -> Result<VolatileString> {
        if let Some(name) = self.names.get(&h) {
            return Ok(name.clone());
        }
        let name = VolatileString::from(self.heap.read_payload(h)?);
        self.names.insert(h, name.clone());
        Ok(name)
    }

    fn materialize(&self, c: &Container) -> Result<Row> {
        let mut row = Row::with_capacity(c.pairs.len());
        for &(name, value) in &c.pairs {
            let name = self.name_of(BlockHandle::from_offset(name))?;
            let value = DurableString::attach(&self.heap, BlockHandle::from_offset(value))?;
            row.insert(name, value);
        }
        Ok(row)
    }

    fn intern_name(&self, name: VolatileString) -> Result<BlockHandle> {
        let h = DurableString::new(&self.heap, name.remaining(), Interning::Cached)?.handle();
        if !self.names.contains_key(&h) {
            let name = if name.is_undrained() {
                name
            } else {
                VolatileString::from(name.remaining())
            };
            self.names.insert(h, name);
        }
        Ok(h)
    }

    /// A caller-built value that nothing references yet can be linked as is
    fn adoptable(&self, d: &DurableString, staged: &Staged) -> Result<bool> {
        Ok(d.reusable_on(&self.heap, Interning::Unique)
            && !staged.holds_value(d.handle())
            && d.state()? == BlockState::Unvalidated)
    }

    /// Intern names and convert values to unique durable strings
    fn stage(&self, row: Row) -> Result<Staged> {
        let mut staged = Staged {
            pairs: Vec::with_capacity(row.len()),
            fresh: Vec::new(),
        };
        let converted = (|| -> Result<()> {
            for (name, value) in row {
                let name = self.intern_name(name)?;
                let adopt = match &value {
                    Field::Durable(d) => self.adoptable(d, &staged)?,
                    Field::Volatile(_) => false,
                };
                let value = match value {
                    Field::Durable(d) if adopt => d,
                    Field::Durable(mut d) => {
                        DurableString::from_sequence(&self.heap, &mut d, Interning::Unique)?
                    }
                    Field::Volatile(v) => v.into_durable(&self.heap, Interning::Unique)?,
                };
                staged.fresh.push(value.handle());
                staged.pairs.push((name, value.handle()));
            }
            Ok(())
        })();
        match converted {
            Ok(()) => Ok(staged),
            Err(e) => {
                self.discard(&staged.fresh);
                Err(e)
            }
        }
    }

    /// Free blocks of an operation that never linked them
    fn discard(&self, blocks: &[BlockHandle]) {
        for &h in blocks {
            if let Err(e) = self.heap.destroy(h) {
                warn!(block = h.offset(), error = %e, "could not free unlinked block");
            }
        }
    }

    fn build_container(&self, pairs: &[(u64, u64)], capacity: u64) -> Result<BlockHandle> {
        let heap = &self.heap;
        let block = heap.allocate(ROW, row_len(capacity))?;
        let written = (|| -> Result<()> {
            heap.write_word(block, ROW_COUNT, pairs.len() as u64)?;
            for (i, &(name, value)) in pairs.iter().enumerate() {
                heap.write_word(block, row_name_word(i as u64), name)?;
                heap.write_word(block, row_value_word(i as u64), value)?;
            }
            Ok(())
        })();
        match written {
            Ok(()) => Ok(block),
            Err(e) => {
                self.discard(&[block]);
                Err(e)
            }
        }
    }

    fn build_container_within(
        &self,
        section: &mut FailureAtomicSection<'_>,
        pairs: &[(u64, u64)],
        capacity: u64,
    ) -> Result<BlockHandle> {
        let block = section.allocate(ROW, row_len(capacity))?;
        section.write_word(block, ROW_COUNT, pairs.len() as u64)?;
        for (i, &(name, value)) in pairs.iter().enumerate() {
            section.write_word(block, row_name_word(i as u64), name)?;
            section.write_word(block, row_value_word(i as u64), value)?;
        }
        Ok(block)
    }

    fn capacity_for(&self, fields: usize) -> u64 {
        (fields as u64).max(self.config.row_capacity)
    }

    /// Location of the pointer that references `entry` in its chain
    fn predecessor(&self, bucket: u64, entry: BlockHandle) -> Result<(BlockHandle, u64)> {
        let mut at = (self.buckets, bucket_word(bucket));
        loop {
            let cursor = self.heap.read_word(at.0, at.1)?;
            if cursor == 0 {
                return Err(Error::corruption(format!(
                    "entry {} missing from bucket {}",
                    entry.offset(),
                    bucket
                )));
            }
            if cursor == entry.offset() {
                return Ok(at);
            }
            at = (BlockHandle::from_offset(cursor), ENTRY_NEXT);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Row stored under `key`
    ///
    /// Values are durable strings attached to the stored blocks.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no row is stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Row> {
        let slot = self.slot(key)?;
        let container = self.load_container(slot.entry)?;
        self.materialize(&container)
    }

    // ========================================================================
    // Strong path
    // ========================================================================

    /// Store `row` under `key`, replacing any row already there
    ///
    /// Follows the insert sequence of the update protocol. A replaced
    /// row's container and values are invalidated once the new row is
    /// durably linked; the replaced row is returned and stays readable
    /// until the next [`reclaim`](Self::reclaim).
    pub fn put(&self, key: &[u8], row: Row) -> Result<Option<Row>> {
        self.check_usable()?;
        let result = self.put_inner(key, row);
        self.observe("put", result)
    }

    fn put_inner(&self, key: &[u8], row: Row) -> Result<Option<Row>> {
        let bucket = self.bucket_of(key);
        let _chain = self.stripe(bucket).lock();
        let mut staged = self.stage(row)?;
        let mut linked = false;
        let result = if self.index.contains_key(key) {
            self.replace_row(key, &mut staged, &mut linked).map(Some)
        } else {
            self.insert_row(key, bucket, &mut staged, &mut linked)
                .map(|()| None)
        };
        if result.is_err() && !linked {
            self.discard(&staged.fresh);
        }
        result
    }

    fn insert_row(
        &self,
        key: &[u8],
        bucket: u64,
        staged: &mut Staged,
        linked: &mut bool,
    ) -> Result<()> {
        let heap = &self.heap;
        let pairs: Vec<(u64, u64)> = staged
            .pairs
            .iter()
            .map(|&(n, v)| (n.offset(), v.offset()))
            .collect();
        let container = self.build_container(&pairs, self.capacity_for(pairs.len()))?;
        staged.fresh.push(container);
        let key_block = DurableString::new(heap, key, Interning::Unique)?.handle();
        staged.fresh.push(key_block);
        let entry = heap.allocate(MAP_ENTRY, ENTRY_LEN)?;
        staged.fresh.push(entry);

        let head = heap.read_word(self.buckets, bucket_word(bucket))?;
        heap.write_word(entry, ENTRY_KEY, key_block.offset())?;
        heap.write_word(entry, ENTRY_ROW, container.offset())?;
        heap.write_word(entry, ENTRY_NEXT, head)?;
        heap.crash_point(protocol::insert::AFTER_POPULATE)?;

        let link = bucket_word(bucket);
        UpdateProtocol::new(heap).publish(&staged.fresh, &INSERT, || {
            heap.write_word(self.buckets, link, entry.offset())?;
            *linked = true;
            heap.flush_at(self.buckets, link * 8, 8)
        })?;
        self.index
            .insert(Box::from(key), Arc::new(RowSlot::new(entry, key_block)));
        debug!(key = %String::from_utf8_lossy(key), fields = pairs.len(), "row inserted");
        Ok(())
    }

    fn replace_row(&self, key: &[u8], staged: &mut Staged, linked: &mut bool) -> Result<Row> {
        let heap = &self.heap;
        let pairs: Vec<(u64, u64)> = staged
            .pairs
            .iter()
            .map(|&(n, v)| (n.offset(), v.offset()))
            .collect();
        let container = self.build_container(&pairs, self.capacity_for(pairs.len()))?;
        staged.fresh.push(container);
        heap.crash_point(protocol::insert::AFTER_POPULATE)?;

        let staged = &*staged;
        let previous = self.with_row_exclusive(key, |slot| {
            let old = self.load_container(slot.entry)?;
            let steps = UpdateProtocol::new(heap);
            steps.publish(&staged.fresh, &INSERT, || {
                heap.write_word(slot.entry, ENTRY_ROW, container.offset())?;
                *linked = true;
                heap.flush_at(slot.entry, ENTRY_ROW * 8, 8)
            })?;
            let previous = self.materialize(&old)?;
            let mut retired: Vec<BlockHandle> =
                old.values().filter(|&v| !staged.holds_value(v)).collect();
            retired.push(old.block);
            steps.retire(&retired, protocol::insert::AFTER_RETIRE)?;
            Ok(previous)
        })?;
        debug!(key = %String::from_utf8_lossy(key), fields = pairs.len(), "row replaced");
        Ok(previous)
    }

    /// Set fields of the row stored under `key`
    ///
    /// Fields not named in `values` keep their value; fields the row lacks
    /// are added, relocating the row container if it is full. Each old value
    /// is invalidated only after its replacement is durable.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no row is stored under `key`.
    pub fn update(&self, key: &[u8], values: Row) -> Result<()> {
        self.check_usable()?;
        let result = self.update_inner(key, values);
        self.observe("update", result)
    }

    fn update_inner(&self, key: &[u8], values: Row) -> Result<()> {
        if !self.index.contains_key(key) {
            return Err(missing(key));
        }
        let heap = &self.heap;
        let staged = self.stage(values)?;
        let prepared = (|| -> Result<()> {
            for &h in &staged.fresh {
                heap.flush_block(h)?;
            }
            for &h in &staged.fresh {
                heap.validate(h)?;
            }
            Ok(())
        })();
        if let Err(e) = prepared {
            self.discard(&staged.fresh);
            return Err(e);
        }

        let steps = UpdateProtocol::new(heap);
        let mut linked = false;
        let result = self.with_row_exclusive(key, |slot| {
            steps.prefence()?;
            let old = self.load_container(slot.entry)?;
            let plan = Plan::new(&old, &staged.pairs);
            let mut retired = plan.retired.clone();
            if plan.pairs.len() as u64 <= old.capacity {
                steps.replace(|| {
                    linked = true;
                    self.apply_in_place(&old, &plan)
                })?;
            } else {
                let capacity = (plan.pairs.len() as u64)
                    .max(2 * old.capacity)
                    .max(self.config.row_capacity);
                let grown = self.build_container(&plan.pairs, capacity)?;
                let published = steps.publish(&[grown], &GROW, || {
                    heap.write_word(slot.entry, ENTRY_ROW, grown.offset())?;
                    linked = true;
                    heap.flush_at(slot.entry, ENTRY_ROW * 8, 8)
                });
                if let Err(e) = published {
                    if !linked {
                        self.discard(&[grown]);
                    }
                    return Err(e);
                }
                retired.push(old.block);
                debug!(
                    key = %String::from_utf8_lossy(key),
                    from = old.capacity,
                    to = capacity,
                    "row container relocated"
                );
            }
            steps.retire(&retired, protocol::update::AFTER_INVALIDATE)?;
            Ok(plan.replaced.len())
        });
        match result {
            Ok(replaced) => {
                debug!(
                    key = %String::from_utf8_lossy(key),
                    fields = staged.pairs.len(),
                    replaced,
                    "row updated"
                );
                Ok(())
            }
            Err(e) => {
                if !linked {
                    self.discard(&staged.fresh);
                }
                Err(e)
            }
        }
    }

    /// Store replaced references and appended fields into a container with
    /// room for them, flushing every store
    fn apply_in_place(&self, old: &Container, plan: &Plan) -> Result<()> {
        let heap = &self.heap;
        for &i in &plan.replaced {
            let word = row_value_word(i as u64);
            heap.write_word(old.block, word, plan.pairs[i].1)?;
            heap.flush_at(old.block, word * 8, 8)?;
        }
        let appended = plan.appended(old);
        if appended.is_empty() {
            return Ok(());
        }
        let base = old.pairs.len() as u64;
        for (i, &(name, value)) in appended.iter().enumerate() {
            heap.write_word(old.block, row_name_word(base + i as u64), name)?;
            heap.write_word(old.block, row_value_word(base + i as u64), value)?;
        }
        heap.flush_at(old.block, row_name_word(base) * 8, 16 * appended.len() as u64)?;
        // Pairs durable before the count exposes them
        heap.fence()?;
        heap.write_word(old.block, ROW_COUNT, plan.pairs.len() as u64)?;
        heap.flush_at(old.block, ROW_COUNT * 8, 8)
    }

    /// Unlink the row stored under `key` and return it
    ///
    /// The entry, key and row container are invalidated. The returned
    /// row's values are not: retiring them is the caller's decision (see
    /// [`Row::invalidate_values`]).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no row is stored under `key`.
    pub fn remove(&self, key: &[u8]) -> Result<Row> {
        self.check_usable()?;
        let result = self.remove_inner(key);
        self.observe("remove", result)
    }

    fn remove_inner(&self, key: &[u8]) -> Result<Row> {
        let heap = &self.heap;
        let bucket = self.bucket_of(key);
        let _chain = self.stripe(bucket).lock();
        let row = self.with_row_exclusive(key, |slot| {
            let (prev, word) = self.predecessor(bucket, slot.entry)?;
            let next = heap.read_word(slot.entry, ENTRY_NEXT)?;
            let old = self.load_container(slot.entry)?;
            let steps = UpdateProtocol::new(heap);
            steps.unlink(|| {
                heap.write_word(prev, word, next)?;
                heap.flush_at(prev, word * 8, 8)
            })?;
            slot.live.store(false, Ordering::Release);
            let row = self.materialize(&old)?;
            steps.retire(
                &[slot.entry, slot.key, old.block],
                protocol::remove::AFTER_INVALIDATE,
            )?;
            Ok(row)
        });
        // An unlinked row leaves the index even if retiring it failed
        if let Some(slot) = self.index.get(key).map(|s| Arc::clone(s.value())) {
            if !slot.live.load(Ordering::Acquire) {
                self.index.remove(key);
            }
        }
        let row = row?;
        debug!(key = %String::from_utf8_lossy(key), fields = row.len(), "row removed");
        Ok(row)
    }

    // ========================================================================
    // Weak path
    // ========================================================================
    //
    // Stores go through a caller's failure-atomic section: no flush or fence
    // per step, invalidations deferred to commit, locks held until commit or
    // abort. Row exclusion is always the row mutex here. A section must not
    // carry two mutations of one map: the locks it holds are not reentrant.

    /// Store `row` under `key` inside `section`
    ///
    /// The index learns about a new key when the section commits.
    pub fn insert_within(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
        row: Row,
    ) -> Result<()> {
        self.check_usable()?;
        let result = self.insert_within_inner(section, key, row);
        self.observe("insert_within", result)
    }

    fn adopt_all(&self, section: &mut FailureAtomicSection<'_>, staged: &Staged) -> Result<()> {
        for (i, &h) in staged.fresh.iter().enumerate() {
            if let Err(e) = section.adopt(h) {
                self.discard(&staged.fresh[i..]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn insert_within_inner(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
        row: Row,
    ) -> Result<()> {
        self.check_section(section)?;
        let bucket = self.bucket_of(key);
        section.hold(self.stripe(bucket).lock_arc());
        let staged = self.stage(row)?;
        self.adopt_all(section, &staged)?;
        let pairs: Vec<(u64, u64)> = staged
            .pairs
            .iter()
            .map(|&(n, v)| (n.offset(), v.offset()))
            .collect();
        let container =
            self.build_container_within(section, &pairs, self.capacity_for(pairs.len()))?;

        match self.index.get(key).map(|s| Arc::clone(s.value())) {
            None => {
                let key_block = DurableString::new(&self.heap, key, Interning::Unique)?.handle();
                if let Err(e) = section.adopt(key_block) {
                    self.discard(&[key_block]);
                    return Err(e);
                }
                let entry = section.allocate(MAP_ENTRY, ENTRY_LEN)?;
                let head = self.heap.read_word(self.buckets, bucket_word(bucket))?;
                section.write_word(entry, ENTRY_KEY, key_block.offset())?;
                section.write_word(entry, ENTRY_ROW, container.offset())?;
                section.write_word(entry, ENTRY_NEXT, head)?;
                section.write_word(self.buckets, bucket_word(bucket), entry.offset())?;
                let index = Arc::clone(&self.index);
                let key: Box<[u8]> = Box::from(key);
                section.on_commit(move || {
                    index.insert(key, Arc::new(RowSlot::new(entry, key_block)));
                });
            }
            Some(slot) => {
                section.hold(slot.lock.lock_arc());
                Self::ensure_live(&slot, key)?;
                let old = self.load_container(slot.entry)?;
                section.write_word(slot.entry, ENTRY_ROW, container.offset())?;
                for v in old.values().filter(|&v| !staged.holds_value(v)) {
                    section.invalidate_on_commit(v);
                }
                section.invalidate_on_commit(old.block);
            }
        }
        debug!(key = %String::from_utf8_lossy(key), fields = pairs.len(), "row staged in section");
        Ok(())
    }

    /// Set fields of the row under `key` inside `section`
    ///
    /// References are replaced without flushing; old values are invalidated
    /// when the section commits.
    pub fn update_within(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
        values: Row,
    ) -> Result<()> {
        self.check_usable()?;
        let result = self.update_within_inner(section, key, values);
        self.observe("update_within", result)
    }

    fn update_within_inner(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
        values: Row,
    ) -> Result<()> {
        self.check_section(section)?;
        let slot = self.slot(key)?;
        section.hold(slot.lock.lock_arc());
        Self::ensure_live(&slot, key)?;
        let staged = self.stage(values)?;
        self.adopt_all(section, &staged)?;

        let old = self.load_container(slot.entry)?;
        let plan = Plan::new(&old, &staged.pairs);
        if plan.pairs.len() as u64 <= old.capacity {
            for &i in &plan.replaced {
                section.write_word(old.block, row_value_word(i as u64), plan.pairs[i].1)?;
            }
            let appended = plan.appended(&old);
            let base = old.pairs.len() as u64;
            for (i, &(name, value)) in appended.iter().enumerate() {
                section.write_word(old.block, row_name_word(base + i as u64), name)?;
                section.write_word(old.block, row_value_word(base + i as u64), value)?;
            }
            if !appended.is_empty() {
                section.write_word(old.block, ROW_COUNT, plan.pairs.len() as u64)?;
            }
        } else {
            let capacity = (plan.pairs.len() as u64)
                .max(2 * old.capacity)
                .max(self.config.row_capacity);
            let grown = self.build_container_within(section, &plan.pairs, capacity)?;
            section.write_word(slot.entry, ENTRY_ROW, grown.offset())?;
            section.invalidate_on_commit(old.block);
        }
        for &h in &plan.retired {
            section.invalidate_on_commit(h);
        }
        debug!(
            key = %String::from_utf8_lossy(key),
            replaced = plan.replaced.len(),
            "row update staged in section"
        );
        Ok(())
    }

    /// Unlink the row under `key` inside `section` and return it
    ///
    /// The key leaves the index when the section commits. As with
    /// [`remove`](Self::remove), the returned values are the caller's to
    /// retire (typically with [`FailureAtomicSection::invalidate_on_commit`]).
    pub fn remove_within(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
    ) -> Result<Row> {
        self.check_usable()?;
        let result = self.remove_within_inner(section, key);
        self.observe("remove_within", result)
    }

    fn remove_within_inner(
        &self,
        section: &mut FailureAtomicSection<'_>,
        key: &[u8],
    ) -> Result<Row> {
        self.check_section(section)?;
        let bucket = self.bucket_of(key);
        section.hold(self.stripe(bucket).lock_arc());
        let slot = self.slot(key)?;
        section.hold(slot.lock.lock_arc());
        Self::ensure_live(&slot, key)?;

        let (prev, word) = self.predecessor(bucket, slot.entry)?;
        let next = self.heap.read_word(slot.entry, ENTRY_NEXT)?;
        let old = self.load_container(slot.entry)?;
        section.write_word(prev, word, next)?;
        section.invalidate_on_commit(slot.entry);
        section.invalidate_on_commit(slot.key);
        section.invalidate_on_commit(old.block);
        let row = self.materialize(&old)?;

        let index = Arc::clone(&self.index);
        let key: Box<[u8]> = Box::from(key);
        section.on_commit(move || {
            slot.live.store(false, Ordering::Release);
            index.remove(&key);
        });
        Ok(row)
    }
}

impl fmt::Debug for DurableMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableMap")
            .field("root_slot", &self.root_slot)
            .field("buckets", &self.bucket_count)
            .field("rows", &self.index.len())
            .field("discipline", &self.config.discipline)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::registry;
    use nvbench_pmem::PmemConfig;

    fn map(config: MapConfig) -> DurableMap {
        let (heap, _) = Heap::open(PmemConfig::for_testing(), registry().unwrap()).unwrap();
        DurableMap::open(heap, 0, config).unwrap()
    }

    fn text(map: &DurableMap, key: &str) -> std::collections::HashMap<String, String> {
        map.get(key.as_bytes()).unwrap().to_string_map().unwrap()
    }

    #[test]
    fn test_put_get() {
        let map = map(MapConfig::for_testing());
        assert!(map
            .put(b"k", Row::from_strings([("f", "v")]))
            .unwrap()
            .is_none());
        assert_eq!(text(&map, "k")["f"], "v");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(b"k"));
    }

    #[test]
    fn test_missing_key() {
        let map = map(MapConfig::for_testing());
        assert!(map.get(b"nope").unwrap_err().is_not_found());
        assert!(map
            .update(b"nope", Row::from_strings([("f", "v")]))
            .unwrap_err()
            .is_not_found());
        assert!(map.remove(b"nope").unwrap_err().is_not_found());
        assert!(!map.is_poisoned());
    }

    #[test]
    fn test_put_replaces_and_retires() {
        let map = map(MapConfig::for_testing());
        map.put(b"k", Row::from_strings([("f", "old")])).unwrap();
        let old_value = map.get(b"k").unwrap().durable_handles()[0];
        let previous = map
            .put(b"k", Row::from_strings([("g", "new")]))
            .unwrap()
            .unwrap();
        assert_eq!(previous.to_string_map().unwrap()["f"], "old");
        let now = text(&map, "k");
        assert_eq!(now.len(), 1);
        assert_eq!(now["g"], "new");
        assert_eq!(
            map.heap().header(old_value).unwrap().state,
            BlockState::Invalidated
        );
    }

    #[test]
    fn test_names_are_shared_across_rows() {
        let map = map(MapConfig::for_testing());
        map.put(b"a", Row::from_strings([("field0", "1")])).unwrap();
        map.put(b"b", Row::from_strings([("field0", "2")])).unwrap();
        assert_eq!(map.heap().interned_len(), 1);
    }

    #[test]
    fn test_update_grows_row() {
        let map = map(MapConfig::for_testing());
        map.put(b"k", Row::from_strings([("a", "1")])).unwrap();
        map.update(b"k", Row::from_strings([("b", "2")])).unwrap();
        map.update(b"k", Row::from_strings([("c", "3"), ("d", "4")]))
            .unwrap();
        let row = text(&map, "k");
        assert_eq!(row.len(), 4);
        assert_eq!(row["a"], "1");
        assert_eq!(row["d"], "4");
    }

    #[test]
    fn test_unvalidated_value_is_linked_without_copy() {
        let map = map(MapConfig::for_testing());
        let value = DurableString::new(map.heap(), b"v", Interning::Unique).unwrap();
        let handle = value.handle();
        let mut row = Row::new();
        row.insert("f", value);
        map.put(b"k", row).unwrap();
        let stored = map.get(b"k").unwrap();
        assert_eq!(stored.durable_handles(), vec![handle]);
        assert_eq!(
            map.heap().header(handle).unwrap().state,
            BlockState::Validated
        );
    }

    #[test]
    fn test_remove_unlinks_but_keeps_values() {
        let map = map(MapConfig::for_testing());
        map.put(b"k", Row::from_strings([("f", "v")])).unwrap();
        let row = map.remove(b"k").unwrap();
        assert!(!map.contains_key(b"k"));
        let value = row.durable_handles()[0];
        assert_eq!(map.heap().header(value).unwrap().state, BlockState::Validated);
        assert_eq!(row.invalidate_values().unwrap(), 1);
    }

    #[test]
    fn test_chain_removal_in_shared_bucket() {
        let map = map(MapConfig::for_testing().with_buckets(1));
        for k in ["a", "b", "c"] {
            map.put(k.as_bytes(), Row::from_strings([("f", k)])).unwrap();
        }
        map.remove(b"b").unwrap();
        assert_eq!(text(&map, "a")["f"], "a");
        assert_eq!(text(&map, "c")["f"], "c");
        map.remove(b"c").unwrap();
        map.remove(b"a").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_compute_discipline() {
        let map = map(MapConfig::for_testing().with_discipline(Discipline::Compute));
        map.put(b"k", Row::from_strings([("f", "1")])).unwrap();
        map.update(b"k", Row::from_strings([("f", "2")])).unwrap();
        assert_eq!(text(&map, "k")["f"], "2");
        map.remove(b"k").unwrap();
        assert!(map.get(b"k").is_err());
    }

    #[test]
    fn test_poisoned_after_fence_failure() {
        let map = map(MapConfig::for_testing());
        map.put(b"k", Row::from_strings([("f", "1")])).unwrap();
        map.heap().faults().fail_fences(true);
        let err = map
            .update(b"k", Row::from_strings([("f", "2")]))
            .unwrap_err();
        assert!(matches!(err, Error::Durability(_)));
        map.heap().faults().fail_fences(false);
        assert!(map.is_poisoned());
        assert!(matches!(
            map.put(b"x", Row::new()),
            Err(Error::Durability(_))
        ));
        // Reads still work
        assert_eq!(text(&map, "k")["f"], "1");
    }
}
