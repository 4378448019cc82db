//! Reorder window and XOR-based FEC groups.

use ahash::AHashMap;
use std::collections::VecDeque;

/// Slots in the per-stream reorder window.
pub const REORDER_BUFFER_SIZE: usize = 128;

/// How long an out-of-order packet may hold up its successors.
pub const MAX_REORDER_WAIT_US: i64 = 40_000;

/// Packets further than this behind `max_seq` are beyond saving.
pub const MAX_OOO_WINDOW: u16 = 50;

/// Every n-th sequence slot anchors an FEC group.
pub const FEC_PACKET_INTERVAL: u16 = 5;

/// FEC groups retained per stream.
const MAX_FEC_GROUPS: usize = 16;

/// A packet parked until its turn in the media pipeline.
#[derive(Debug)]
pub struct PendingPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub arrival_us: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored {
        /// A later sequence number was already waiting; the stream sees
        /// this arrival as reordered.
        reordered: bool,
    },
    /// Window full; the packet was dropped.
    Full,
    /// Too far behind `max_seq` to be useful.
    Stale,
}

/// Bounded reorder window.
///
/// Holds recently arrived packets keyed by sequence number. A packet
/// becomes eligible for release when it is the direct successor of the
/// last released one, or when it is the best candidate available and has
/// waited at least [`MAX_REORDER_WAIT_US`].
pub struct ReorderWindow {
    slots: Vec<Option<PendingPacket>>,
    last_released: Option<u16>,
}

impl Default for ReorderWindow {
    fn default() -> Self {
        Self {
            slots: (0..REORDER_BUFFER_SIZE).map(|_| None).collect(),
            last_released: None,
        }
    }
}

impl ReorderWindow {
    pub fn insert(&mut self, packet: PendingPacket, max_seq: u16) -> InsertOutcome {
        if self.last_released.is_some() {
            let behind = max_seq.wrapping_sub(packet.sequence);
            if behind > 0 && behind <= u16::MAX / 2 && behind > MAX_OOO_WINDOW {
                return InsertOutcome::Stale;
            }
        }

        let reordered = self.slots.iter().flatten().any(|p| {
            let ahead = p.sequence.wrapping_sub(packet.sequence);
            ahead > 0 && ahead <= u16::MAX / 2
        });

        let Some(free) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return InsertOutcome::Full;
        };

        *free = Some(packet);
        InsertOutcome::Stored { reordered }
    }

    /// Releases the next packet ready for processing, if any.
    pub fn pop_ready(&mut self, now_us: i64) -> Option<PendingPacket> {
        let Some(last) = self.last_released else {
            // Nothing released yet: start with the earliest arrival.
            let idx = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|p| (i, p.arrival_us)))
                .min_by_key(|&(_, arrival)| arrival)
                .map(|(i, _)| i)?;
            return self.release(idx);
        };

        let successor = last.wrapping_add(1);
        let mut best: Option<(usize, u16)> = None;

        for (i, slot) in self.slots.iter().enumerate() {
            let Some(p) = slot else { continue };
            if p.sequence == successor {
                return self.release(i);
            }

            let distance = p.sequence.wrapping_sub(last);
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((i, distance));
            }
        }

        // No direct successor; hand out the best candidate once it has
        // waited long enough.
        let (idx, _) = best?;
        let waited = now_us
            - self.slots[idx]
                .as_ref()
                .map(|p| p.arrival_us)
                .unwrap_or(now_us);
        if waited >= MAX_REORDER_WAIT_US {
            return self.release(idx);
        }

        None
    }

    fn release(&mut self, idx: usize) -> Option<PendingPacket> {
        let packet = self.slots[idx].take()?;

        // The release cursor only moves forward; handing out a late
        // duplicate must not drag the successor search backwards.
        let ahead = match self.last_released {
            Some(last) => {
                let d = packet.sequence.wrapping_sub(last);
                d > 0 && d <= u16::MAX / 2
            }
            None => true,
        };
        if ahead {
            self.last_released = Some(packet.sequence);
        }

        Some(packet)
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// One XOR redundancy group.
///
/// The anchor slot (sequence ≡ 0 mod [`FEC_PACKET_INTERVAL`]) carries the
/// XOR of the following members, zero-padded to the longest payload.
/// Holding the redundancy and all members but one reconstructs the missing
/// member byte-exact for its original length.
#[derive(Debug, Default)]
pub struct FecGroup {
    members: [Option<Vec<u8>>; (FEC_PACKET_INTERVAL - 1) as usize],
    redundancy: Option<Vec<u8>>,
}

impl FecGroup {
    pub fn insert(&mut self, offset: u16, payload: &[u8]) {
        if offset == 0 {
            self.redundancy = Some(payload.to_vec());
        } else {
            self.members[offset as usize - 1] = Some(payload.to_vec());
        }
    }

    /// Reconstructs the member at `offset` (1-based within the group) by
    /// XOR-ing the redundancy with every other received member.
    pub fn recover(&self, offset: u16) -> Option<Vec<u8>> {
        if offset == 0 || offset >= FEC_PACKET_INTERVAL {
            return None;
        }

        let redundancy = self.redundancy.as_ref()?;
        let missing = offset as usize - 1;
        if self.members[missing].is_some() {
            return None;
        }

        let mut others = Vec::new();
        for (i, member) in self.members.iter().enumerate() {
            if i == missing {
                continue;
            }
            // Exactly one member may be absent.
            others.push(member.as_ref()?);
        }

        let len = others
            .iter()
            .map(|m| m.len())
            .chain([redundancy.len()])
            .max()?;

        let mut out = vec![0u8; len];
        out[..redundancy.len()].copy_from_slice(redundancy);
        for member in others {
            for (o, b) in out.iter_mut().zip(member.iter()) {
                *o ^= b;
            }
        }

        Some(out)
    }
}

/// Per-stream FEC group table, bounded to the most recent groups.
#[derive(Default)]
pub struct FecAssembler {
    groups: AHashMap<u16, FecGroup>,
    order: VecDeque<u16>,
}

impl FecAssembler {
    pub fn insert(&mut self, sequence: u16, payload: &[u8]) {
        let base = sequence - sequence % FEC_PACKET_INTERVAL;
        let offset = sequence % FEC_PACKET_INTERVAL;

        if !self.groups.contains_key(&base) {
            if self.order.len() >= MAX_FEC_GROUPS {
                if let Some(evicted) = self.order.pop_front() {
                    self.groups.remove(&evicted);
                }
            }
            self.order.push_back(base);
            self.groups.insert(base, FecGroup::default());
        }

        if let Some(group) = self.groups.get_mut(&base) {
            group.insert(offset, payload);
        }
    }

    pub fn recover(&self, sequence: u16) -> Option<Vec<u8>> {
        let base = sequence - sequence % FEC_PACKET_INTERVAL;
        self.groups
            .get(&base)?
            .recover(sequence % FEC_PACKET_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(seq: u16, arrival_us: i64) -> PendingPacket {
        PendingPacket {
            sequence: seq,
            timestamp: seq as u32 * 160,
            arrival_us,
            payload: vec![seq as u8; 4],
        }
    }

    #[test]
    fn in_order_packets_flow_straight_through() {
        let mut window = ReorderWindow::default();

        for seq in 100u16..110 {
            window.insert(pending(seq, seq as i64), seq);
            let released = window.pop_ready(seq as i64).unwrap();
            assert_eq!(released.sequence, seq);
        }
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn swapped_pair_is_released_in_sequence_order() {
        let mut window = ReorderWindow::default();
        window.insert(pending(100, 0), 100);
        assert_eq!(window.pop_ready(0).unwrap().sequence, 100);

        let out = window.insert(pending(102, 10), 102);
        assert_eq!(out, InsertOutcome::Stored { reordered: false });
        assert!(window.pop_ready(10).is_none());

        let out = window.insert(pending(101, 20), 102);
        assert_eq!(out, InsertOutcome::Stored { reordered: true });

        assert_eq!(window.pop_ready(20).unwrap().sequence, 101);
        assert_eq!(window.pop_ready(20).unwrap().sequence, 102);
    }

    #[test]
    fn best_available_released_after_the_wait_budget() {
        let mut window = ReorderWindow::default();
        window.insert(pending(100, 0), 100);
        window.pop_ready(0);

        // 101 never arrives.
        window.insert(pending(102, 1_000), 102);
        assert!(window.pop_ready(10_000).is_none());
        assert_eq!(
            window.pop_ready(1_000 + MAX_REORDER_WAIT_US).unwrap().sequence,
            102
        );
    }

    #[test]
    fn stale_packets_are_discarded() {
        let mut window = ReorderWindow::default();
        window.insert(pending(500, 0), 500);
        window.pop_ready(0);

        let out = window.insert(pending(400, 1), 500);
        assert_eq!(out, InsertOutcome::Stale);
    }

    #[test]
    fn fec_recovers_one_missing_member() {
        let payloads: Vec<Vec<u8>> = (1u8..5).map(|i| vec![i; 32]).collect();
        let mut redundancy = vec![0u8; 32];
        for p in &payloads {
            for (r, b) in redundancy.iter_mut().zip(p.iter()) {
                *r ^= b;
            }
        }

        let mut group = FecGroup::default();
        group.insert(0, &redundancy);
        group.insert(1, &payloads[0]);
        // Member 2 (sequence base+2) lost.
        group.insert(3, &payloads[2]);
        group.insert(4, &payloads[3]);

        assert_eq!(group.recover(2).unwrap(), payloads[1]);
        // Present members cannot be "recovered".
        assert_eq!(group.recover(1), None);
    }

    #[test]
    fn fec_pads_unequal_lengths_with_zeros() {
        let a = vec![0x11u8; 16];
        let b = vec![0x22u8; 32];
        let mut redundancy = vec![0u8; 32];
        for p in [&a, &b] {
            for (r, x) in redundancy.iter_mut().zip(p.iter()) {
                *r ^= x;
            }
        }

        let mut group = FecGroup::default();
        group.insert(0, &redundancy);
        group.insert(2, &b);
        group.insert(3, &[]);
        group.insert(4, &[]);

        // The short member recovers its own bytes; the padding is zero.
        let recovered = group.recover(1).unwrap();
        assert_eq!(&recovered[..16], &a[..]);
        assert!(recovered[16..].iter().all(|&x| x == 0));
    }

    #[test]
    fn fec_needs_all_other_members() {
        let mut group = FecGroup::default();
        group.insert(0, &[0xff; 8]);
        group.insert(1, &[0x01; 8]);
        // Members 2 and 3 both missing.
        group.insert(4, &[0x04; 8]);

        assert_eq!(group.recover(2), None);
    }

    #[test]
    fn assembler_routes_by_group() {
        let mut fec = FecAssembler::default();

        // Group base 100: anchor carries XOR of members 101..=104.
        let members: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i + 1; 8]).collect();
        let mut redundancy = vec![0u8; 8];
        for m in &members {
            for (r, b) in redundancy.iter_mut().zip(m.iter()) {
                *r ^= b;
            }
        }

        fec.insert(100, &redundancy);
        fec.insert(101, &members[0]);
        fec.insert(103, &members[2]);
        fec.insert(104, &members[3]);

        assert_eq!(fec.recover(102).unwrap(), members[1]);
        assert_eq!(fec.recover(107), None);
    }
}
