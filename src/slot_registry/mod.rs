//! A weight-ordered registry of allocation records.
//!
//! Records, flags and weights live in parallel arrays which are always kept
//! in descending weight order. The position of a record in those arrays is
//! its slot. Slots move whenever a weight changes, so callers only ever hold
//! on to the stable [AllocationKey] which is mapped to the current slot
//! through an indirection table.

mod slot_flags;

use crate::CacheError;

pub use self::slot_flags::SlotFlags;

/// The largest weight a slot can reach. The top bit is never used.
pub const MAX_WEIGHT: u8 = 0x7F;

/// A stable identifier for an allocation.
///
/// Keys are assigned in creation order and never change, no matter how the
/// registry reorders its slots. Treat the key as opaque.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AllocationKey(u32);

impl AllocationKey {
    /// The creation order of this key.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Records kept in descending weight order with a key to slot indirection.
pub struct WeightedSlotRegistry<R> {
    records: Vec<R>,
    flags: Vec<SlotFlags>,
    weights: Vec<u8>,
    key_of_slot: Vec<AllocationKey>,
    slot_of_key: Vec<usize>,
    capacity: usize,
}

// Public API
// ----------

impl<R> WeightedSlotRegistry<R> {
    /// Create an empty registry which can hold at most capacity records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            flags: Vec::with_capacity(capacity),
            weights: Vec::with_capacity(capacity),
            key_of_slot: Vec::with_capacity(capacity),
            slot_of_key: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Register a new record with zero weight and no flags.
    ///
    /// New records take the lowest-weight position at the end of storage.
    pub fn push(&mut self, record: R) -> Result<AllocationKey, CacheError> {
        if self.is_full() {
            return Err(CacheError::AllocatorFull);
        }
        let key = AllocationKey(self.slot_of_key.len() as u32);
        let slot = self.records.len();
        self.records.push(record);
        self.flags.push(SlotFlags::empty());
        self.weights.push(0);
        self.key_of_slot.push(key);
        self.slot_of_key.push(slot);
        Ok(key)
    }

    /// The current slot for a key.
    pub fn slot(&self, key: AllocationKey) -> Option<usize> {
        self.slot_of_key.get(key.index()).copied()
    }

    /// The key stored at a slot.
    pub fn key(&self, slot: usize) -> AllocationKey {
        self.key_of_slot[slot]
    }

    /// Every key in the registry, in creation order.
    pub fn keys(&self) -> impl Iterator<Item = AllocationKey> {
        (0..self.slot_of_key.len() as u32).map(AllocationKey)
    }

    pub fn record(&self, slot: usize) -> &R {
        &self.records[slot]
    }

    pub fn record_mut(&mut self, slot: usize) -> &mut R {
        &mut self.records[slot]
    }

    pub fn flags(&self, slot: usize) -> SlotFlags {
        self.flags[slot]
    }

    pub fn insert_flags(&mut self, slot: usize, flags: SlotFlags) {
        self.flags[slot].insert(flags);
    }

    pub fn remove_flags(&mut self, slot: usize, flags: SlotFlags) {
        self.flags[slot].remove(flags);
    }

    /// Clear flags on every slot.
    pub fn remove_flags_everywhere(&mut self, flags: SlotFlags) {
        for slot_flags in &mut self.flags {
            slot_flags.remove(flags);
        }
    }

    pub fn weight(&self, slot: usize) -> u8 {
        self.weights[slot]
    }

    /// Record a cache hit for key.
    ///
    /// The key's weight grows by inc, every slot heavier than the new weight
    /// decays by dec (but never below the new weight), and the key moves to
    /// the front of its new weight class.
    ///
    /// # Returns
    ///
    /// The key's new slot. Any slot index obtained before this call is stale.
    pub fn bump(&mut self, key: AllocationKey, inc: u8, dec: u8) -> usize {
        let slot = self.slot_of_key[key.index()];
        let new_weight = self.weights[slot].saturating_add(inc).min(MAX_WEIGHT);

        for weight in &mut self.weights[..slot] {
            if *weight > new_weight {
                *weight = weight.saturating_sub(dec).max(new_weight);
            }
        }
        self.weights[slot] = new_weight;

        let target = self.weights[..slot]
            .iter()
            .position(|&weight| weight <= new_weight)
            .unwrap_or(slot);
        self.move_slot(slot, target);
        target
    }

    /// Drop a key's weight to zero and move it behind every other slot.
    pub fn demote(&mut self, key: AllocationKey) -> usize {
        let slot = self.slot_of_key[key.index()];
        self.weights[slot] = 0;
        let target = self.records.len() - 1;
        self.move_slot(slot, target);
        target
    }

    /// The lowest-weight slot which has every flag in `with` and none of the
    /// flags in `without`.
    pub fn find_lowest(
        &self,
        with: SlotFlags,
        without: SlotFlags,
    ) -> Option<usize> {
        self.lowest_first(with, without).next()
    }

    /// All slots matching the flag predicates, lowest weight first. Among
    /// equal weights the later slot comes first.
    pub fn lowest_first(
        &self,
        with: SlotFlags,
        without: SlotFlags,
    ) -> impl Iterator<Item = usize> + '_ {
        (0..self.flags.len()).rev().filter(move |&slot| {
            self.flags[slot].contains(with)
                && !self.flags[slot].intersects(without)
        })
    }

    /// All slots which have every flag in `with`, in slot order.
    pub fn slots_with(
        &self,
        with: SlotFlags,
    ) -> impl Iterator<Item = usize> + '_ {
        (0..self.flags.len())
            .filter(move |&slot| self.flags[slot].contains(with))
    }
}

// Private API
// -----------

impl<R> WeightedSlotRegistry<R> {
    /// Move the entry at `from` to `to`, shifting everything in between by
    /// one and keeping the indirection table in sync.
    fn move_slot(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let (start, end) = (from.min(to), from.max(to));
        if to < from {
            self.records[start..=end].rotate_right(1);
            self.flags[start..=end].rotate_right(1);
            self.weights[start..=end].rotate_right(1);
            self.key_of_slot[start..=end].rotate_right(1);
        } else {
            self.records[start..=end].rotate_left(1);
            self.flags[start..=end].rotate_left(1);
            self.weights[start..=end].rotate_left(1);
            self.key_of_slot[start..=end].rotate_left(1);
        }
        for slot in start..=end {
            self.slot_of_key[self.key_of_slot[slot].index()] = slot;
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    fn registry_with(count: usize) -> WeightedSlotRegistry<&'static str> {
        let names = ["a", "b", "c", "d", "e", "f"];
        let mut registry = WeightedSlotRegistry::new(count);
        for name in names.iter().take(count) {
            registry.push(*name).unwrap();
        }
        registry
    }

    fn order(registry: &WeightedSlotRegistry<&'static str>) -> String {
        (0..registry.len())
            .map(|slot| *registry.record(slot))
            .collect()
    }

    fn weights_lowest_first(
        registry: &WeightedSlotRegistry<&'static str>,
    ) -> Vec<u8> {
        (0..registry.len())
            .rev()
            .map(|slot| registry.weight(slot))
            .collect()
    }

    #[test]
    fn keys_follow_creation_order() {
        let registry = registry_with(3);
        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec![AllocationKey(0), AllocationKey(1), AllocationKey(2)]
        );
        assert_eq!(registry.slot(AllocationKey(2)), Some(2));
        assert_eq!(registry.slot(AllocationKey(3)), None);
    }

    #[test]
    fn push_fails_when_full() {
        let mut registry = registry_with(2);
        assert!(matches!(
            registry.push("z"),
            Err(CacheError::AllocatorFull)
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn bump_moves_the_slot_forward() {
        let mut registry = registry_with(4);
        let slot = registry.bump(AllocationKey(2), 2, 1);
        assert_eq!(slot, 0);
        assert_eq!(order(&registry), "cabd");
        assert_eq!(registry.slot(AllocationKey(2)), Some(0));
        assert_eq!(registry.slot(AllocationKey(0)), Some(1));
        assert_eq!(registry.key(3), AllocationKey(3));
    }

    #[test]
    fn bump_decays_heavier_slots() {
        let mut registry = registry_with(3);
        registry.bump(AllocationKey(0), 10, 1);
        registry.bump(AllocationKey(1), 2, 3);

        // a was at 10 and decays by 3 while b climbs to 2
        let a = registry.slot(AllocationKey(0)).unwrap();
        let b = registry.slot(AllocationKey(1)).unwrap();
        assert_eq!(registry.weight(a), 7);
        assert_eq!(registry.weight(b), 2);
        assert_eq!(order(&registry), "abc");
    }

    #[test]
    fn decay_never_crosses_the_new_weight() {
        let mut registry = registry_with(3);
        registry.bump(AllocationKey(0), 10, 0);
        registry.bump(AllocationKey(1), 6, 0);
        registry.bump(AllocationKey(2), 7, 100);
        assert_eq!(order(&registry), "cab");
        assert_eq!(weights_lowest_first(&registry), vec![6, 7, 7]);
    }

    #[test]
    fn weights_saturate() {
        let mut registry = registry_with(1);
        for _ in 0..100 {
            registry.bump(AllocationKey(0), 50, 1);
        }
        assert_eq!(registry.weight(0), MAX_WEIGHT);
    }

    #[test]
    fn weights_stay_sorted() {
        let mut registry = registry_with(6);
        let pattern = [3, 1, 4, 1, 5, 0, 2, 5, 3, 5, 4, 2, 1, 0, 0, 3];
        for (round, &index) in pattern.iter().enumerate() {
            registry.bump(AllocationKey(index), (round % 4) as u8 + 1, 2);
            let weights = weights_lowest_first(&registry);
            assert!(
                weights.windows(2).all(|pair| pair[0] <= pair[1]),
                "weights out of order after round {round}: {weights:?}"
            );
            for key in registry.keys() {
                let slot = registry.slot(key).unwrap();
                assert_eq!(registry.key(slot), key);
            }
        }
    }

    #[test]
    fn flags_move_with_their_slot() {
        let mut registry = registry_with(3);
        let slot = registry.slot(AllocationKey(2)).unwrap();
        registry.insert_flags(slot, SlotFlags::STAGED);
        let slot = registry.bump(AllocationKey(2), 1, 1);
        assert_eq!(registry.flags(slot), SlotFlags::STAGED);
        assert_eq!(registry.flags(2), SlotFlags::empty());
    }

    #[test]
    fn find_lowest_honours_flag_predicates() {
        let mut registry = registry_with(4);
        registry.insert_flags(0, SlotFlags::STAGED);
        registry.insert_flags(1, SlotFlags::STAGED);
        registry.insert_flags(2, SlotFlags::STAGED | SlotFlags::TO_DRAW);

        assert_eq!(
            registry.find_lowest(SlotFlags::STAGED, SlotFlags::TO_DRAW),
            Some(1)
        );
        assert_eq!(
            registry.find_lowest(SlotFlags::STAGED, SlotFlags::empty()),
            Some(2)
        );
        assert_eq!(
            registry.find_lowest(SlotFlags::UPLOADED, SlotFlags::empty()),
            None
        );
        assert_eq!(
            registry
                .lowest_first(SlotFlags::empty(), SlotFlags::STAGED)
                .collect::<Vec<_>>(),
            vec![3]
        );
    }

    #[test]
    fn demote_moves_to_the_tail() {
        let mut registry = registry_with(3);
        registry.bump(AllocationKey(0), 5, 0);
        let slot = registry.demote(AllocationKey(0));
        assert_eq!(slot, 2);
        assert_eq!(order(&registry), "bca");
        assert_eq!(registry.weight(2), 0);
    }
}
