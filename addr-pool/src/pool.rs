//! The address pool: an arena of (source IP, source port) entries threaded
//! onto free/used intrusive lists, with a dense map for O(1) release.

use crate::rss::{self, ByteOrder};
use color_eyre::eyre::{bail, ensure, eyre, Report, WrapErr};
use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Ports below this are reserved for well-known services.
const MIN_PORT: u16 = 1025;

/// Usable ports per IP: [1025, 65535].
const NUM_PORTS: usize = (u16::MAX - MIN_PORT) as usize + 1;

/// Null link/slot marker. Entry indices are `u32`, so the arena is capped at
/// `u32::MAX - 1` entries (checked at construction).
const NIL: u32 = u32::MAX;

/// One allocatable local endpoint plus its list linkage.
///
/// Entries live in the pool's arena for the pool's whole lifetime; fetch and
/// free only relink them between the free and used lists.
struct AddrEntry {
    ip: Ipv4Addr,
    port: u16,
    prev: u32,
    next: u32,
    /// true iff this entry is on the used list. Lets `free` reject tuples
    /// that were never fetched (or already freed) instead of corrupting the
    /// lists.
    in_use: bool,
}

/// An intrusive doubly-linked list over arena indices.
struct EntryList {
    head: u32,
    tail: u32,
}

impl EntryList {
    fn new() -> Self {
        EntryList {
            head: NIL,
            tail: NIL,
        }
    }

    fn push_tail(&mut self, entries: &mut [AddrEntry], idx: u32) {
        entries[idx as usize].prev = self.tail;
        entries[idx as usize].next = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            entries[self.tail as usize].next = idx;
        }

        self.tail = idx;
    }

    fn unlink(&mut self, entries: &mut [AddrEntry], idx: u32) {
        let (prev, next) = {
            let e = &entries[idx as usize];
            (e.prev, e.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            entries[prev as usize].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            entries[next as usize].prev = prev;
        }

        entries[idx as usize].prev = NIL;
        entries[idx as usize].next = NIL;
    }
}

/// Dense index from (IP offset, port) to arena slot. Built once at
/// construction, read-only afterward; only `free` consults it.
struct AddrMap {
    /// pool base address, host order.
    base: u32,
    num_addr: usize,
    slots: Vec<u32>,
}

impl AddrMap {
    fn new(base: u32, num_addr: usize) -> Result<Self, Report> {
        let len = num_addr * NUM_PORTS;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(len)
            .wrap_err("allocating address map")?;
        slots.resize(len, NIL);
        Ok(AddrMap {
            base,
            num_addr,
            slots,
        })
    }

    fn insert(&mut self, ip_off: usize, port: u16, idx: u32) {
        self.slots[ip_off * NUM_PORTS + (port - MIN_PORT) as usize] = idx;
    }

    fn get(&self, addr: SocketAddrV4) -> Option<u32> {
        // checked_sub rejects addresses below base; the < num_addr check must
        // be conjoined with it, not OR'd.
        let off = u32::from(*addr.ip()).checked_sub(self.base)? as usize;
        if off >= self.num_addr || addr.port() < MIN_PORT {
            return None;
        }

        match self.slots[off * NUM_PORTS + (addr.port() - MIN_PORT) as usize] {
            NIL => None,
            idx => Some(idx),
        }
    }
}

/// Everything fetch/free mutate, guarded as a unit.
struct PoolState {
    entries: Vec<AddrEntry>,
    free: EntryList,
    used: EntryList,
    num_free: usize,
    num_used: usize,
}

struct CoreFilter {
    core: usize,
    num_queues: usize,
    dest: SocketAddrV4,
}

/// A pool of local (source IP, source port) tuples for originating
/// connections.
///
/// Built either flat ([`AddrPool::new`]: the full tuple space) or partitioned
/// ([`AddrPool::new_for_core`]: only tuples whose RSS affinity matches one
/// core, so the first free entry always qualifies and fetch is O(1)).
///
/// All mutable state sits behind one mutex; [`fetch`](AddrPool::fetch) and
/// [`free`](AddrPool::free) are atomic with respect to list membership and
/// counters, so the pool can be shared across worker threads. Teardown is
/// `Drop`.
pub struct AddrPool {
    num_entry: usize,
    byte_order: ByteOrder,
    map: AddrMap,
    inner: Mutex<PoolState>,
}

impl Debug for AddrPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrPool")
            .field("base", &Ipv4Addr::from(self.map.base))
            .field("num_addr", &self.map.num_addr)
            .field("num_entry", &self.num_entry)
            .finish()
    }
}

impl AddrPool {
    /// A flat pool: one entry per (IP, port) combination over `num_addr`
    /// addresses starting at `base_addr` and the full usable port range.
    pub fn new(
        base_addr: Ipv4Addr,
        num_addr: usize,
        byte_order: ByteOrder,
    ) -> Result<Self, Report> {
        Self::build(base_addr, num_addr, byte_order, None)
    }

    /// A pool holding only tuples that RSS-hash to `core`, assuming traffic
    /// directed at `dest`.
    ///
    /// Scans the same tuple space as [`AddrPool::new`] and keeps a tuple only
    /// if the affinity function steers `(dest, tuple)` to `core` out of
    /// `num_queues` queues. The resulting entry count depends on how the hash
    /// partitions the space; if it comes out below `max_concurrency` (the
    /// configured per-core connection bound, 0 to disable the check) a
    /// capacity warning is logged so partition imbalance is visible before it
    /// causes connect failures under load.
    pub fn new_for_core(
        core: usize,
        num_queues: usize,
        base_addr: Ipv4Addr,
        num_addr: usize,
        dest: SocketAddrV4,
        max_concurrency: usize,
        byte_order: ByteOrder,
    ) -> Result<Self, Report> {
        ensure!(num_queues >= 1, "need at least one queue");
        ensure!(
            core < num_queues,
            "core {} out of range for {} queues",
            core,
            num_queues
        );

        let pool = Self::build(
            base_addr,
            num_addr,
            byte_order,
            Some(CoreFilter {
                core,
                num_queues,
                dest,
            }),
        )?;

        debug!(core, num_entry = pool.num_entry, "built per-core address pool");
        if max_concurrency > 0 && pool.num_entry < max_concurrency {
            warn!(
                core,
                num_entry = pool.num_entry,
                max_concurrency,
                "available addresses smaller than max concurrency"
            );
        }

        Ok(pool)
    }

    fn build(
        base_addr: Ipv4Addr,
        num_addr: usize,
        byte_order: ByteOrder,
        filter: Option<CoreFilter>,
    ) -> Result<Self, Report> {
        ensure!(num_addr >= 1, "need at least one usable address");
        let base = u32::from(base_addr);
        let last = u32::try_from(num_addr - 1)
            .ok()
            .and_then(|n| base.checked_add(n));
        ensure!(
            last.is_some(),
            "address range {}/{} wraps past 255.255.255.255",
            base_addr,
            num_addr
        );

        let total = num_addr
            .checked_mul(NUM_PORTS)
            .ok_or_else(|| eyre!("entry count overflow"))?;
        ensure!(
            total < NIL as usize,
            "entry count {} exceeds pool index space",
            total
        );

        // for a partitioned pool, total / num_queues is only a capacity hint:
        // the hash need not split the space evenly, and the arena grows past
        // the hint rather than dropping tuples.
        let hint = match filter {
            Some(ref f) => total / f.num_queues,
            None => total,
        };
        let mut entries: Vec<AddrEntry> = Vec::new();
        entries
            .try_reserve_exact(hint)
            .wrap_err("allocating address pool arena")?;
        let mut map = AddrMap::new(base, num_addr)?;
        let mut free = EntryList::new();

        for i in 0..num_addr {
            let ip = Ipv4Addr::from(base + i as u32);
            for port in MIN_PORT..=u16::MAX {
                if let Some(ref f) = filter {
                    let rss_core = rss::compute_rss_core(
                        *f.dest.ip(),
                        ip,
                        f.dest.port(),
                        port,
                        f.num_queues,
                        byte_order,
                    );
                    if rss_core != f.core {
                        continue;
                    }
                }

                let idx = entries.len() as u32;
                entries.push(AddrEntry {
                    ip,
                    port,
                    prev: NIL,
                    next: NIL,
                    in_use: false,
                });
                map.insert(i, port, idx);
                free.push_tail(&mut entries, idx);
            }
        }

        let num_entry = entries.len();
        Ok(AddrPool {
            num_entry,
            byte_order,
            map,
            inner: Mutex::new(PoolState {
                entries,
                free,
                used: EntryList::new(),
                num_free: num_entry,
                num_used: 0,
            }),
        })
    }

    /// Remove and return a free tuple whose RSS affinity for `dest` matches
    /// `core`, moving it to the used list.
    ///
    /// Scans the free list from the head; on a partitioned pool every free
    /// entry already satisfies the affinity check (for the destination the
    /// pool was built with), so the scan takes the first entry. On a flat
    /// pool this is O(free-list length) worst case.
    ///
    /// Exhaustion (no free entry steers to `core`) is a definitive failure
    /// for this call with no state mutated; callers back off, pick another
    /// core, or reject the connection attempt.
    pub fn fetch(
        &self,
        core: usize,
        num_queues: usize,
        dest: SocketAddrV4,
    ) -> Result<SocketAddrV4, Report> {
        ensure!(num_queues >= 1, "need at least one queue");
        ensure!(
            core < num_queues,
            "core {} out of range for {} queues",
            core,
            num_queues
        );

        let mut inner_g = self.inner.lock().unwrap();
        let inner = &mut *inner_g;
        let mut walk = inner.free.head;
        while walk != NIL {
            let e = &inner.entries[walk as usize];
            let rss_core = rss::compute_rss_core(
                *dest.ip(),
                e.ip,
                dest.port(),
                e.port,
                num_queues,
                self.byte_order,
            );
            if rss_core == core {
                break;
            }

            walk = e.next;
        }

        if walk == NIL {
            bail!(
                "no free address steers to core {} of {} queues",
                core,
                num_queues
            );
        }

        inner.free.unlink(&mut inner.entries, walk);
        inner.used.push_tail(&mut inner.entries, walk);
        let e = &mut inner.entries[walk as usize];
        e.in_use = true;
        inner.num_free -= 1;
        inner.num_used += 1;
        Ok(SocketAddrV4::new(e.ip, e.port))
    }

    /// Return a tuple previously obtained from [`fetch`](AddrPool::fetch) to
    /// the free list.
    ///
    /// O(1): the tuple is located through the address map. Fails, mutating
    /// nothing, if the tuple lies outside the pool's address range or is not
    /// currently in use (double free, or never fetched) -- those are caller
    /// bugs to surface, not absorb.
    pub fn free(&self, addr: SocketAddrV4) -> Result<(), Report> {
        let idx = self
            .map
            .get(addr)
            .ok_or_else(|| eyre!("address {} not in pool", addr))?;

        let mut inner_g = self.inner.lock().unwrap();
        let inner = &mut *inner_g;
        ensure!(
            inner.entries[idx as usize].in_use,
            "address {} is not in use (double free?)",
            addr
        );

        inner.used.unlink(&mut inner.entries, idx);
        inner.free.push_tail(&mut inner.entries, idx);
        inner.entries[idx as usize].in_use = false;
        inner.num_used -= 1;
        inner.num_free += 1;
        Ok(())
    }

    /// Total entries in the pool. Fixed at construction.
    pub fn num_entries(&self) -> usize {
        self.num_entry
    }

    pub fn num_free(&self) -> usize {
        self.inner.lock().unwrap().num_free
    }

    pub fn num_used(&self) -> usize {
        self.inner.lock().unwrap().num_used
    }
}
