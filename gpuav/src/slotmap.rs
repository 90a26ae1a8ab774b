use std::{fmt, iter::FusedIterator};

const NIL: u32 = u32::MAX;

const OCCUPIED_BIT: u32 = 1;

/// Identifies a slot of a [`SlotMap`] together with the generation it was inserted at.
///
/// The generation's low bit is set for every ID handed out, so a vacant slot never compares
/// equal to an ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    #[inline]
    pub(crate) const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }

    /// The generation without its occupied bit, truncated to the 31 bits the device sees.
    #[inline]
    pub(crate) const fn tag(self) -> u32 {
        (self.generation >> 1) & 0x7FFF_FFFF
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({}v{})", self.index, self.generation >> 1)
    }
}

/// A generational arena with a fixed maximum number of slots.
///
/// Removing a value bumps the slot's generation, so IDs of removed values never resolve again,
/// even after the slot has been reused. Slot indices are stable and dense, which lets the
/// descriptor heap mirror the map one-to-one into a device buffer.
pub(crate) struct SlotMap<V> {
    slots: Vec<Slot<V>>,
    len: u32,
    capacity: u32,
    free_list_head: u32,
}

struct Slot<V> {
    generation: u32,
    state: SlotState<V>,
}

enum SlotState<V> {
    Occupied(V),
    Vacant { next_free: u32 },
}

impl<V> SlotMap<V> {
    #[inline]
    pub(crate) fn with_capacity(capacity: u32) -> Self {
        assert!(capacity < NIL);

        SlotMap {
            slots: Vec::new(),
            len: 0,
            capacity,
            free_list_head: NIL,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Inserts `value`, returning it back if every slot is occupied.
    pub(crate) fn try_insert(&mut self, value: V) -> Result<SlotId, V> {
        if self.free_list_head != NIL {
            let index = self.free_list_head;
            let slot = &mut self.slots[index as usize];

            let SlotState::Vacant { next_free } = slot.state else {
                unreachable!("the free list only links vacant slots");
            };

            let generation = slot.generation.wrapping_add(OCCUPIED_BIT);
            slot.generation = generation;
            slot.state = SlotState::Occupied(value);

            self.free_list_head = next_free;
            self.len += 1;

            Ok(SlotId { index, generation })
        } else if (self.slots.len() as u32) < self.capacity {
            let index = self.slots.len() as u32;
            let generation = OCCUPIED_BIT;

            self.slots.push(Slot {
                generation,
                state: SlotState::Occupied(value),
            });

            self.len += 1;

            Ok(SlotId { index, generation })
        } else {
            Err(value)
        }
    }

    pub(crate) fn remove(&mut self, id: SlotId) -> Option<V> {
        let slot = self.slots.get_mut(id.index as usize)?;

        if slot.generation != id.generation {
            return None;
        }

        slot.generation = id.generation.wrapping_add(OCCUPIED_BIT);

        let state = std::mem::replace(
            &mut slot.state,
            SlotState::Vacant {
                next_free: self.free_list_head,
            },
        );
        self.free_list_head = id.index;
        self.len -= 1;

        match state {
            SlotState::Occupied(value) => Some(value),
            SlotState::Vacant { .. } => unreachable!(),
        }
    }

    #[inline]
    pub(crate) fn get(&self, id: SlotId) -> Option<&V> {
        let slot = self.slots.get(id.index as usize)?;

        match &slot.state {
            SlotState::Occupied(value) if slot.generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut V> {
        let slot = self.slots.get_mut(id.index as usize)?;

        match &mut slot.state {
            SlotState::Occupied(value) if slot.generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn iter(&self) -> Iter<'_, V> {
        Iter {
            inner: self.slots.iter().enumerate(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for SlotMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub(crate) struct Iter<'a, V> {
    inner: std::iter::Enumerate<std::slice::Iter<'a, Slot<V>>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (SlotId, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        for (index, slot) in self.inner.by_ref() {
            if let SlotState::Occupied(value) = &slot.state {
                let id = SlotId {
                    index: index as u32,
                    generation: slot.generation,
                };

                return Some((id, value));
            }
        }

        None
    }
}

impl<V> FusedIterator for Iter<'_, V> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_usage() {
        let mut map = SlotMap::with_capacity(8);

        let x = map.try_insert(69).unwrap();
        let y = map.try_insert(42).unwrap();

        assert_eq!(map.get(x), Some(&69));
        assert_eq!(map.get(y), Some(&42));

        map.remove(x);

        let x2 = map.try_insert(12).unwrap();

        assert_eq!(x2.index(), x.index());
        assert_ne!(x2.tag(), x.tag());
        assert_eq!(map.get(x2), Some(&12));
        assert_eq!(map.get(x), None);
        assert_eq!(map.remove(x), None);

        map.remove(y);
        map.remove(x2);

        assert_eq!(map.get(y), None);
        assert_eq!(map.get(x2), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut map = SlotMap::with_capacity(2);

        let a = map.try_insert('a').unwrap();
        map.try_insert('b').unwrap();
        assert_eq!(map.try_insert('c'), Err('c'));

        map.remove(a);
        assert!(map.try_insert('c').is_ok());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn iter_skips_vacant() {
        let mut map = SlotMap::with_capacity(4);

        let a = map.try_insert(1).unwrap();
        let b = map.try_insert(2).unwrap();
        let c = map.try_insert(3).unwrap();
        map.remove(b);

        let ids: Vec<_> = map.iter().map(|(id, &v)| (id, v)).collect();
        assert_eq!(ids, [(a, 1), (c, 3)]);
    }

    #[test]
    fn tag_drops_the_occupied_bit() {
        let id = SlotId {
            index: 3,
            generation: u32::MAX,
        };
        assert_eq!(id.tag(), 0x7FFF_FFFF);

        let mut map = SlotMap::with_capacity(1);
        let first = map.try_insert(()).unwrap();
        assert_eq!(first.generation() & OCCUPIED_BIT, OCCUPIED_BIT);
        assert_eq!(first.tag(), 0);

        map.remove(first);
        let second = map.try_insert(()).unwrap();
        assert_eq!(second.tag(), 1);
    }
}
