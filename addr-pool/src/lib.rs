//! RSS-affine local address pools for a userspace TCP stack.
//!
//! When the stack originates a connection it must pick a local (source IP,
//! source port) tuple, and under receive-side scaling that choice decides
//! which queue (and so which core) the return traffic lands on. [`AddrPool`]
//! manages the local tuple space so connection setup can grab a tuple whose
//! RSS affinity matches the requesting core, and connection teardown can hand
//! it back.
//!
//! Pools come in two shapes: a flat pool over the full tuple space, where
//! each fetch scans for an affinity match, and a per-core partitioned pool
//! pre-filtered at construction so the first free entry always qualifies.
//! The software model of the NIC's hash lives in [`rss`].

mod pool;
pub mod rss;

pub use pool::AddrPool;
