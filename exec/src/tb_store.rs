use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, trace};

use dbt_core::{BlockKey, PageWriteObserver, TbRef, TranslationBlock};

use crate::config::ExecConfig;
use crate::error::ExecError;

/// Outcome of [`TbStore::insert`].
pub enum Insert<C> {
    /// The new unit is now cached.
    Inserted(TbRef<C>),
    /// Another thread cached the same key first; use its unit.
    Existing(TbRef<C>),
    /// A covered page was written while the unit was being built.
    Stale,
}

struct TbTables<C> {
    /// Chained hash table keyed by physical PC.
    buckets: Box<[Vec<TbRef<C>>]>,
    /// Physical page -> units covering it.
    pages: HashMap<u64, Vec<TbRef<C>>>,
    /// Physical page -> epoch of the last write seen while a build
    /// was in flight. Emptied once no build is outstanding.
    page_epoch: HashMap<u64, u64>,
    epoch: u64,
    live: usize,
}

/// Words in the code-page filter; one bit per page hash.
const CODE_FILTER_WORDS: usize = 64;

/// An in-flight unit build, opened by [`TbStore::begin_build`].
///
/// Page writes are recorded against it until it is dropped, so
/// [`TbStore::insert`] can tell whether the bytes it translated
/// are still current.
pub struct BuildTicket<'a, C> {
    store: &'a TbStore<C>,
    built_at: u64,
}

impl<C> BuildTicket<'_, C> {
    pub fn built_at(&self) -> u64 {
        self.built_at
    }
}

impl<C> Drop for BuildTicket<'_, C> {
    fn drop(&mut self) {
        let mut t = self.store.tables.lock();
        if self.store.building.fetch_sub(1, Ordering::SeqCst) == 1 {
            t.page_epoch.clear();
        }
    }
}

/// Thread-safe translation cache shared by all vCPUs.
///
/// One mutex guards the hash chains, the page lists and all
/// successor-link mutations; it is held only for the duration of a
/// lookup, insert, link or invalidation, never while a unit runs.
/// Per-TB `jmp` locks are only ever taken one at a time under it,
/// so readers on the execution path can follow links without the
/// store lock.
pub struct TbStore<C> {
    tables: Mutex<TbTables<C>>,
    hash_mask: u64,
    capacity: usize,
    verify: bool,
    /// Outstanding [`BuildTicket`]s. Changed only under the store lock.
    building: AtomicUsize,
    /// Conservative set of pages that may hold code, hashed into
    /// bits. Lets writes to data pages skip the store lock.
    code_filter: Box<[AtomicU64]>,
    flush_gen: AtomicU64,
    invalidations: AtomicU64,
    flushes: AtomicU64,
}

impl<C> TbStore<C> {
    pub fn new(hash_bits: u32, capacity: usize) -> Self {
        let size = 1usize << hash_bits;
        Self {
            tables: Mutex::new(TbTables {
                buckets: (0..size).map(|_| Vec::new()).collect(),
                pages: HashMap::new(),
                page_epoch: HashMap::new(),
                epoch: 0,
                live: 0,
            }),
            hash_mask: size as u64 - 1,
            capacity,
            verify: false,
            building: AtomicUsize::new(0),
            code_filter: (0..CODE_FILTER_WORDS).map(|_| AtomicU64::new(0)).collect(),
            flush_gen: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ExecConfig) -> Self {
        let mut store = Self::new(config.hash_bits, config.tb_capacity);
        store.verify = config.verify_cache;
        store
    }

    fn bucket(&self, key: &BlockKey, phys_pc: u64, cflags: u32) -> usize {
        (key.hash(phys_pc, cflags) & self.hash_mask) as usize
    }

    /// Lookup a valid TB by `(key, cflags)` in the hash table.
    pub fn lookup(&self, key: &BlockKey, cflags: u32, phys_pc: u64) -> Option<TbRef<C>> {
        let t = self.tables.lock();
        Self::find(&t, self.bucket(key, phys_pc, cflags), key, cflags, phys_pc)
    }

    fn find(
        t: &TbTables<C>,
        bucket: usize,
        key: &BlockKey,
        cflags: u32,
        phys_pc: u64,
    ) -> Option<TbRef<C>> {
        t.buckets[bucket]
            .iter()
            .find(|tb| tb.phys_pc == phys_pc && tb.matches(key, cflags))
            .cloned()
    }

    /// Open a build. Take the ticket before reading guest code and
    /// hand it to [`Self::insert`].
    pub fn begin_build(&self) -> BuildTicket<'_, C> {
        let t = self.tables.lock();
        self.building.fetch_add(1, Ordering::SeqCst);
        BuildTicket {
            store: self,
            built_at: t.epoch,
        }
    }

    /// Insert a freshly built TB.
    ///
    /// Rejected as [`Insert::Stale`] if any page it covers was
    /// written after `ticket` was opened. Reaching the capacity
    /// flushes the whole cache first.
    pub fn insert(&self, tb: TranslationBlock<C>, ticket: &BuildTicket<'_, C>) -> Insert<C> {
        let built_at = ticket.built_at;
        let mut t = self.tables.lock();
        let stale = tb
            .page_addr
            .iter()
            .flatten()
            .any(|p| t.page_epoch.get(p).is_some_and(|&e| e > built_at));
        if stale {
            return Insert::Stale;
        }

        let bucket = self.bucket(&tb.key, tb.phys_pc, tb.cflags);
        if let Some(existing) = Self::find(&t, bucket, &tb.key, tb.cflags, tb.phys_pc) {
            return Insert::Existing(existing);
        }

        if t.live >= self.capacity {
            info!(live = t.live, "translation cache full, flushing");
            self.flush_locked(&mut t);
        }

        let tb = Arc::new(tb);
        t.buckets[bucket].push(tb.clone());
        for page in tb.page_addr.iter().flatten() {
            t.pages.entry(*page).or_default().push(tb.clone());
            let (word, bit) = code_filter_slot(*page);
            self.code_filter[word].fetch_or(bit, Ordering::SeqCst);
        }
        t.live += 1;
        Insert::Inserted(tb)
    }

    /// Link `src`'s exit `slot` directly to `dst`.
    ///
    /// Records the reverse edge so `dst` can unlink on
    /// invalidation. Returns `false` if either unit is dead or the
    /// slot is already taken.
    pub fn link(&self, src: &TbRef<C>, slot: usize, dst: &TbRef<C>) -> bool {
        let _t = self.tables.lock();
        if !src.is_valid() || !dst.is_valid() || slot >= 2 {
            return false;
        }
        {
            let mut jmp = src.jmp.lock();
            if jmp.jmp_dest[slot]
                .as_ref()
                .is_some_and(|w| w.strong_count() > 0)
            {
                return false;
            }
            jmp.jmp_dest[slot] = Some(Arc::downgrade(dst));
        }
        dst.jmp.lock().jmp_list.push((Arc::downgrade(src), slot));
        trace!(src = %src.key, slot, dst = %dst.key, "linked");
        true
    }

    /// Invalidate every TB covering physical `page`.
    ///
    /// Returns the number of units dropped.
    pub fn invalidate_page(&self, page: u64) -> usize {
        if self.building.load(Ordering::SeqCst) == 0 && !self.may_have_code(page) {
            return 0;
        }
        let mut t = self.tables.lock();
        if self.building.load(Ordering::SeqCst) > 0 {
            t.epoch += 1;
            let epoch = t.epoch;
            t.page_epoch.insert(page, epoch);
        }
        let Some(list) = t.pages.remove(&page) else {
            return 0;
        };
        let mut n = 0;
        for tb in &list {
            if self.phys_invalidate(&mut t, tb) {
                n += 1;
            }
        }
        if n > 0 {
            trace!(page = format_args!("{page:#x}"), n, "invalidated page");
        }
        n
    }

    /// Invalidate a single TB.
    pub fn invalidate(&self, tb: &TbRef<C>) -> bool {
        let mut t = self.tables.lock();
        self.phys_invalidate(&mut t, tb)
    }

    /// Mark `tb` invalid, unlink all its chained jumps, and remove
    /// it from the hash chain and page lists.
    fn phys_invalidate(&self, t: &mut TbTables<C>, tb: &TbRef<C>) -> bool {
        if !tb.mark_invalid() {
            return false;
        }

        // 1. Unlink incoming edges.
        let incoming = std::mem::take(&mut tb.jmp.lock().jmp_list);
        for (src, slot) in incoming {
            if let Some(src) = src.upgrade() {
                let mut jmp = src.jmp.lock();
                if jmp.jmp_dest[slot]
                    .as_ref()
                    .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(tb)))
                {
                    jmp.jmp_dest[slot] = None;
                }
            }
        }

        // 2. Unlink outgoing edges.
        let outgoing = std::mem::take(&mut tb.jmp.lock().jmp_dest);
        for (slot, dst) in outgoing.into_iter().enumerate() {
            if let Some(dst) = dst.and_then(|w| w.upgrade()) {
                dst.jmp
                    .lock()
                    .jmp_list
                    .retain(|(s, n)| !(std::ptr::eq(s.as_ptr(), Arc::as_ptr(tb)) && *n == slot));
            }
        }

        // 3. Remove from hash chain and page lists.
        let bucket = self.bucket(&tb.key, tb.phys_pc, tb.cflags);
        t.buckets[bucket].retain(|x| !Arc::ptr_eq(x, tb));
        for page in tb.page_addr.iter().flatten() {
            if let Some(list) = t.pages.get_mut(page) {
                list.retain(|x| !Arc::ptr_eq(x, tb));
                if list.is_empty() {
                    t.pages.remove(page);
                }
            }
        }
        t.live -= 1;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Flush all TBs and reset the hash table.
    ///
    /// Units still running on other vCPUs stay alive until they
    /// return; they can no longer be found or linked to.
    pub fn flush(&self) {
        let mut t = self.tables.lock();
        info!(live = t.live, "flushing translation cache");
        self.flush_locked(&mut t);
    }

    fn flush_locked(&self, t: &mut TbTables<C>) {
        for bucket in t.buckets.iter_mut() {
            for tb in bucket.drain(..) {
                tb.mark_invalid();
                let mut jmp = tb.jmp.lock();
                jmp.jmp_dest = [None, None];
                jmp.jmp_list.clear();
            }
        }
        t.pages.clear();
        for word in self.code_filter.iter() {
            word.store(0, Ordering::SeqCst);
        }
        t.live = 0;
        self.flush_gen.fetch_add(1, Ordering::AcqRel);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Check the cache bookkeeping invariants.
    pub fn verify(&self) -> Result<(), ExecError> {
        let t = self.tables.lock();
        let mut live = 0;
        for tb in t.buckets.iter().flatten() {
            live += 1;
            if !tb.is_valid() {
                return Err(ExecError::CacheInvariant(format!(
                    "invalid unit still hashed: {}",
                    tb.key
                )));
            }
            let dests = tb.jmp.lock().jmp_dest.clone();
            for (slot, dst) in dests.iter().enumerate() {
                let Some(dst) = dst.as_ref().and_then(|w| w.upgrade()) else {
                    continue;
                };
                if !dst.is_valid() {
                    return Err(ExecError::CacheInvariant(format!(
                        "dangling successor link {} slot {slot} -> {}",
                        tb.key, dst.key
                    )));
                }
                let back = dst.jmp.lock().jmp_list.iter().any(|(s, n)| {
                    std::ptr::eq(s.as_ptr(), Arc::as_ptr(tb)) && *n == slot
                });
                if !back {
                    return Err(ExecError::CacheInvariant(format!(
                        "missing back-reference {} slot {slot} -> {}",
                        tb.key, dst.key
                    )));
                }
            }
        }
        for (page, list) in &t.pages {
            if let Some(tb) = list.iter().find(|tb| !tb.is_valid() || !tb.covers_page(*page)) {
                return Err(ExecError::CacheInvariant(format!(
                    "page {page:#x} lists stale unit {}",
                    tb.key
                )));
            }
        }
        if live != t.live {
            return Err(ExecError::CacheInvariant(format!(
                "live count {} but {live} units hashed",
                t.live
            )));
        }
        Ok(())
    }

    fn may_have_code(&self, page: u64) -> bool {
        let (word, bit) = code_filter_slot(page);
        self.code_filter[word].load(Ordering::SeqCst) & bit != 0
    }

    /// Pages whose writes are held for builds still in flight.
    pub fn tracked_writes(&self) -> usize {
        self.tables.lock().page_epoch.len()
    }

    /// Whether any live unit covers physical `page`.
    pub fn page_has_code(&self, page: u64) -> bool {
        self.tables.lock().pages.contains_key(&page)
    }

    pub fn len(&self) -> usize {
        self.tables.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped by every flush; per-CPU jump caches compare against it.
    pub fn flush_generation(&self) -> u64 {
        self.flush_gen.load(Ordering::Acquire)
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn verify_enabled(&self) -> bool {
        self.verify
    }
}

fn code_filter_slot(page: u64) -> (usize, u64) {
    let h = (page as usize) % (CODE_FILTER_WORDS * 64);
    (h / 64, 1 << (h % 64))
}

impl<C> Default for TbStore<C> {
    fn default() -> Self {
        Self::from_config(&ExecConfig::default())
    }
}

impl<C> PageWriteObserver for TbStore<C> {
    fn on_page_write(&self, phys_page: u64) {
        self.invalidate_page(phys_page);
    }
}
