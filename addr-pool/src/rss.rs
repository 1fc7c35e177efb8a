//! Software reproduction of the NIC's receive-side scaling hash.
//!
//! The NIC steers a flow to a receive queue by running a Toeplitz hash over the
//! flow's 4-tuple and indexing its redirection table with the low bits. To pick
//! local addresses whose *return* traffic lands on a given core, we have to
//! compute the same mapping in software. This module is a pure function of its
//! arguments; the pool calls it but holds no hash state.
//!
//! The key is 40 bytes of `0x05`. Because the key bitstream has period 8, the
//! per-bit key windows repeat every 8 input bits, which makes the hash
//! invariant under swapping (source IP, source port) with (destination IP,
//! destination port). Both directions of a flow hash to the same queue.

use lazy_static::lazy_static;

const RSS_KEY: [u8; 40] = [0x05; 40];

/// 32 + 32 + 16 + 16 input bits: src ip, dst ip, src port, dst port.
const KEY_CACHE_LEN: usize = 96;

/// The redirection table covers 128 entries, so only the low 7 hash bits
/// select a queue.
const RSS_BIT_MASK: u32 = 0x0000_007f;

lazy_static! {
    static ref KEY_CACHE: [u32; KEY_CACHE_LEN] = build_key_cache();
}

/// Byte-order convention of the I/O backend's redirection table.
///
/// DPDK-style backends consume the table in the same order the hash is
/// computed in; others read it 32 bits at a time on a little-endian host, so
/// the low two index bits come out reversed and we have to apply the same
/// swizzle here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Native,
    Swapped,
}

fn build_key_cache() -> [u32; KEY_CACHE_LEN] {
    let mut cache = [0u32; KEY_CACHE_LEN];
    let mut window = u32::from_be_bytes([RSS_KEY[0], RSS_KEY[1], RSS_KEY[2], RSS_KEY[3]]);
    let mut idx = 32;
    for slot in cache.iter_mut() {
        *slot = window;
        let bit = (RSS_KEY[idx / 8] << (idx % 8)) & 0x80 != 0;
        window = (window << 1) | bit as u32;
        idx += 1;
    }

    cache
}

fn toeplitz_hash(sip: u32, dip: u32, sport: u16, dport: u16) -> u32 {
    let mut res = 0u32;
    let mut sip = sip;
    for word in &KEY_CACHE[0..32] {
        if sip & 0x8000_0000 != 0 {
            res ^= word;
        }
        sip <<= 1;
    }

    let mut dip = dip;
    for word in &KEY_CACHE[32..64] {
        if dip & 0x8000_0000 != 0 {
            res ^= word;
        }
        dip <<= 1;
    }

    let mut sport = sport;
    for word in &KEY_CACHE[64..80] {
        if sport & 0x8000 != 0 {
            res ^= word;
        }
        sport <<= 1;
    }

    let mut dport = dport;
    for word in &KEY_CACHE[80..96] {
        if dport & 0x8000 != 0 {
            res ^= word;
        }
        dport <<= 1;
    }

    res
}

/// Which core/queue the NIC would steer a flow with this 4-tuple to.
///
/// Deterministic and stateless. `num_queues` must be nonzero. Addresses and
/// ports are in host order; the key symmetry means argument direction does not
/// matter.
pub fn compute_rss_core(
    daddr: std::net::Ipv4Addr,
    saddr: std::net::Ipv4Addr,
    dport: u16,
    sport: u16,
    num_queues: usize,
    byte_order: ByteOrder,
) -> usize {
    debug_assert!(num_queues > 0);
    let mut masked = toeplitz_hash(u32::from(daddr), u32::from(saddr), dport, sport) & RSS_BIT_MASK;

    if let ByteOrder::Swapped = byte_order {
        // the table is read as 32-bit words on a little-endian host, so the
        // low two index bits are reversed relative to the hash.
        const OFF: [u32; 4] = [3, 2, 1, 0];
        masked = OFF[(masked & 0x3) as usize] + (masked & !0x3);
    }

    masked as usize % num_queues
}

#[cfg(test)]
mod t {
    use super::{compute_rss_core, ByteOrder};
    use std::net::Ipv4Addr;

    #[test]
    fn symmetric_under_endpoint_swap() {
        let a = Ipv4Addr::new(10, 0, 0, 7);
        let b = Ipv4Addr::new(192, 168, 1, 1);
        for sport in [1025u16, 4096, 33333, 65535] {
            for dport in [80u16, 443, 50000] {
                for bo in [ByteOrder::Native, ByteOrder::Swapped] {
                    assert_eq!(
                        compute_rss_core(b, a, dport, sport, 8, bo),
                        compute_rss_core(a, b, sport, dport, 8, bo),
                    );
                }
            }
        }
    }

    #[test]
    fn result_in_queue_range() {
        let dst = Ipv4Addr::new(192, 168, 1, 1);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        for num_queues in 1..=16 {
            for port in 1025..3025u16 {
                for bo in [ByteOrder::Native, ByteOrder::Swapped] {
                    assert!(compute_rss_core(dst, src, 80, port, num_queues, bo) < num_queues);
                }
            }
        }
    }

    #[test]
    fn all_queues_reachable() {
        let dst = Ipv4Addr::new(192, 168, 1, 1);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let num_queues = 4;
        let mut seen = vec![false; num_queues];
        for port in 1025..=65535u16 {
            seen[compute_rss_core(dst, src, 80, port, num_queues, ByteOrder::Native)] = true;
            if seen.iter().all(|s| *s) {
                return;
            }
        }

        panic!("some queue unreachable: {:?}", seen);
    }

    #[test]
    fn deterministic() {
        let dst = Ipv4Addr::new(172, 16, 5, 2);
        let src = Ipv4Addr::new(10, 1, 2, 3);
        let first = compute_rss_core(dst, src, 443, 9999, 6, ByteOrder::Native);
        for _ in 0..100 {
            assert_eq!(
                compute_rss_core(dst, src, 443, 9999, 6, ByteOrder::Native),
                first
            );
        }
    }
}
