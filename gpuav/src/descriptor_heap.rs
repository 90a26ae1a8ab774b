//! The device-resident table describing every live descriptor.
//!
//! Injected code can't see descriptor sets. Instead, every descriptor the application writes is
//! mirrored into a slot of the [`DescriptorHeap`], a host-visible buffer of fixed-size entries:
//!
//! ```text
//! word 0   generation << 1 | valid
//! word 1   descriptor kind
//! word 2   offset of the bound range, in bytes
//! word 3   size of the bound range in bytes, or texel count for texel buffers
//! ```
//!
//! Slots are never modified in a way that would change the answer for a command already
//! recorded: every write of a descriptor takes a fresh slot, and the slot it replaces is only
//! retired. Retired slots are reclaimed once no snapshot pins them and no pending submission can
//! read them. The only in-place change is clearing the valid bit when the resource behind a
//! descriptor is destroyed, which injected code then reports.
//!
//! For each command, the descriptor sets bound at record time are captured as
//! [`DescriptorSetSnapshot`]s and flattened into a [`BindingTable`] that injected code walks to
//! find the slot of a `(set, binding, index)` triple.

use crate::{
    device::{DeviceBuffer, GpuavDevice},
    record::{heap_word, ADDRESS_ENTRY_WORDS, HEAP_ENTRY_WORDS},
    slotmap::{SlotId, SlotMap},
    vk, DeviceSize, ExhaustedResource, GpuavError,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{collections::BTreeMap, mem::ManuallyDrop, sync::Arc};

/// Identifies one descriptor of a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorBinding {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
}

/// The kind of a descriptor, as stored in word 1 of its heap entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum DescriptorKind {
    UniformBuffer = 1,
    StorageBuffer = 2,
    UniformTexelBuffer = 3,
    StorageTexelBuffer = 4,
    SampledImage = 5,
    StorageImage = 6,
    Sampler = 7,
    CombinedImageSampler = 8,
    InputAttachment = 9,
    AccelerationStructure = 10,
}

impl DescriptorKind {
    /// Converts a Vulkan descriptor type. Dynamic buffers map to their non-dynamic kind, the
    /// dynamic offset being folded into the bounds by the caller.
    pub fn from_vk(ty: vk::DescriptorType) -> Option<Self> {
        Some(match ty {
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                DescriptorKind::UniformBuffer
            }
            vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                DescriptorKind::StorageBuffer
            }
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => DescriptorKind::UniformTexelBuffer,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => DescriptorKind::StorageTexelBuffer,
            vk::DescriptorType::SAMPLED_IMAGE => DescriptorKind::SampledImage,
            vk::DescriptorType::STORAGE_IMAGE => DescriptorKind::StorageImage,
            vk::DescriptorType::SAMPLER => DescriptorKind::Sampler,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => DescriptorKind::CombinedImageSampler,
            vk::DescriptorType::INPUT_ATTACHMENT => DescriptorKind::InputAttachment,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
                DescriptorKind::AccelerationStructure
            }
            _ => return None,
        })
    }

    #[inline]
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            1 => DescriptorKind::UniformBuffer,
            2 => DescriptorKind::StorageBuffer,
            3 => DescriptorKind::UniformTexelBuffer,
            4 => DescriptorKind::StorageTexelBuffer,
            5 => DescriptorKind::SampledImage,
            6 => DescriptorKind::StorageImage,
            7 => DescriptorKind::Sampler,
            8 => DescriptorKind::CombinedImageSampler,
            9 => DescriptorKind::InputAttachment,
            10 => DescriptorKind::AccelerationStructure,
            _ => return None,
        })
    }
}

/// What a descriptor points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBounds {
    pub kind: DescriptorKind,

    /// Offset of the bound range in bytes, for buffers.
    pub offset: DeviceSize,

    /// Size of the bound range in bytes for buffers, number of texels for texel buffers, and
    /// unused for other kinds.
    pub size: DeviceSize,

    /// Raw handle of the buffer, view or acceleration structure the descriptor refers to, so
    /// that destroying it invalidates the descriptor.
    pub resource: Option<u64>,
}

/// One descriptor as a snapshot captured it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Index of the heap slot.
    pub slot: u32,
    /// Generation tag of the slot when the snapshot was taken.
    pub tag: u32,
    pub bounds: DescriptorBounds,
    /// Whether the descriptor was valid when the snapshot was taken.
    pub valid: bool,
}

/// One binding of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingSnapshot {
    /// Every array element of the binding, `None` for elements that were never written.
    pub descriptors: Vec<Option<SnapshotEntry>>,
}

/// The descriptors of one descriptor set at the time a command was recorded.
///
/// As long as the snapshot is alive, the heap slots it refers to are not reclaimed, so that the
/// device reads the entries the snapshot describes.
#[derive(Debug)]
pub struct DescriptorSetSnapshot {
    set: vk::DescriptorSet,
    bindings: BTreeMap<u32, BindingSnapshot>,
    pins: HeapPins,
}

impl DescriptorSetSnapshot {
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    #[inline]
    pub fn binding(&self, binding: u32) -> Option<&BindingSnapshot> {
        self.bindings.get(&binding)
    }

    /// Returns the descriptor at `binding` and `array_element`, if it was written.
    pub fn descriptor(&self, binding: u32, array_element: u32) -> Option<&SnapshotEntry> {
        self.bindings
            .get(&binding)?
            .descriptors
            .get(array_element as usize)?
            .as_ref()
    }

    /// Returns the number of heap slots the snapshot pins.
    #[inline]
    pub fn pinned_slots(&self) -> usize {
        self.pins.slots.len()
    }
}

#[derive(Debug)]
struct HeapPins {
    heap: Arc<DescriptorHeap>,
    slots: Vec<SlotId>,
}

impl Drop for HeapPins {
    fn drop(&mut self) {
        let mut state = self.heap.state.lock();

        for &id in &self.slots {
            if let Some(slot) = state.slots.get_mut(id) {
                slot.pins -= 1;
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    binding: DescriptorBinding,
    bounds: DescriptorBounds,
    valid: bool,
    pins: u32,
    /// The serial of the last submission when the slot was replaced or its set destroyed.
    retired_at: Option<u64>,
}

/// A registered buffer device address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct AddressRange {
    start: u64,
    end: u64,
}

#[derive(Debug)]
struct HeapState {
    slots: SlotMap<Slot>,
    sets: HashMap<vk::DescriptorSet, SetState>,
    resources: HashMap<u64, SmallVec<[SlotId; 2]>>,
    retired: Vec<SlotId>,
    /// Serial of the last submission.
    submitted: u64,
    /// Serial up to which every submission is known to have completed.
    completed: u64,
    addresses: Vec<AddressRange>,
}

#[derive(Debug, Default)]
struct SetState {
    /// Number of descriptors of each binding, if the layout of the set is known.
    layout: Option<BTreeMap<u32, u32>>,
    descriptors: BTreeMap<(u32, u32), SlotId>,
}

/// Mirrors every live descriptor into device memory.
#[derive(Debug)]
pub struct DescriptorHeap {
    device: Arc<dyn GpuavDevice>,
    entries: ManuallyDrop<DeviceBuffer>,
    address_table: ManuallyDrop<DeviceBuffer>,
    address_capacity: u32,
    state: Mutex<HeapState>,
}

impl DescriptorHeap {
    /// Creates a heap of `max_slots` entries, and a buffer device address table of
    /// `max_address_ranges` entries.
    pub fn new(
        device: Arc<dyn GpuavDevice>,
        max_slots: u32,
        max_address_ranges: u32,
    ) -> Result<Arc<Self>, GpuavError> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let entries = device.create_buffer(
            DeviceSize::from(max_slots.max(1)) * DeviceSize::from(HEAP_ENTRY_WORDS) * 4,
            usage,
        )?;
        let address_table = match device.create_buffer(
            (1 + DeviceSize::from(max_address_ranges) * DeviceSize::from(ADDRESS_ENTRY_WORDS)) * 4,
            usage,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                // SAFETY: The buffer was never used.
                unsafe { device.destroy_buffer(entries) };

                return Err(err.into());
            }
        };

        Ok(Arc::new(DescriptorHeap {
            device,
            entries: ManuallyDrop::new(entries),
            address_table: ManuallyDrop::new(address_table),
            address_capacity: max_address_ranges,
            state: Mutex::new(HeapState {
                slots: SlotMap::with_capacity(max_slots),
                sets: HashMap::default(),
                resources: HashMap::default(),
                retired: Vec::new(),
                submitted: 0,
                completed: 0,
                addresses: Vec::new(),
            }),
        }))
    }

    /// Returns the buffer holding the heap entries.
    #[inline]
    pub fn entries(&self) -> &DeviceBuffer {
        &self.entries
    }

    /// Returns the buffer device address table.
    #[inline]
    pub fn address_table(&self) -> &DeviceBuffer {
        &self.address_table
    }

    /// Returns the number of occupied slots, retired ones included.
    pub fn occupied_slots(&self) -> u32 {
        self.state.lock().slots.len()
    }

    /// Records the layout of a newly allocated set, so that snapshots know how many
    /// descriptors each binding has even before they are written.
    pub fn register_set(&self, set: vk::DescriptorSet, bindings: &[(u32, u32)]) {
        let mut state = self.state.lock();
        let set_state = state.sets.entry(set).or_default();
        set_state.layout = Some(bindings.iter().copied().collect());
    }

    /// Writes `bounds` into a fresh slot for `binding`. The slot previously holding the
    /// descriptor, if any, is retired.
    pub fn upsert(
        &self,
        binding: DescriptorBinding,
        bounds: DescriptorBounds,
    ) -> Result<(), GpuavError> {
        let mut state = self.state.lock();

        let slot = Slot {
            binding,
            bounds,
            valid: true,
            pins: 0,
            retired_at: None,
        };

        let id = match state.slots.try_insert(slot) {
            Ok(id) => id,
            Err(slot) => {
                state.reclaim();
                state.slots.try_insert(slot).map_err(|_| GpuavError::ResourceExhausted {
                    resource: ExhaustedResource::DescriptorHeapSlots,
                })?
            }
        };

        self.write_entry(id, &bounds, true);

        if let Some(resource) = bounds.resource {
            state.resources.entry(resource).or_default().push(id);
        }

        let previous = state
            .sets
            .entry(binding.set)
            .or_default()
            .descriptors
            .insert((binding.binding, binding.array_element), id);

        if let Some(previous) = previous {
            state.retire(previous);
        }

        Ok(())
    }

    /// Marks the descriptor at `binding` as destroyed. Commands recorded afterwards, and
    /// pending commands that use it, report it when they access it.
    pub fn invalidate(&self, binding: DescriptorBinding) {
        let mut state = self.state.lock();

        let Some(&id) = state
            .sets
            .get(&binding.set)
            .and_then(|set| set.descriptors.get(&(binding.binding, binding.array_element)))
        else {
            return;
        };

        self.invalidate_slot(&mut state, id);
    }

    /// Marks every descriptor referring to `resource` as destroyed.
    pub fn invalidate_resource(&self, resource: u64) {
        let mut state = self.state.lock();

        let Some(ids) = state.resources.get(&resource).cloned() else {
            return;
        };

        for id in ids {
            self.invalidate_slot(&mut state, id);
        }
    }

    fn invalidate_slot(&self, state: &mut HeapState, id: SlotId) {
        let Some(slot) = state.slots.get_mut(id) else {
            return;
        };

        if slot.valid {
            slot.valid = false;
            let bounds = slot.bounds;
            self.write_entry(id, &bounds, false);
        }
    }

    /// Retires every slot of `set`.
    pub fn on_set_destroyed(&self, set: vk::DescriptorSet) {
        let mut state = self.state.lock();

        if let Some(set_state) = state.sets.remove(&set) {
            for id in set_state.descriptors.into_values() {
                state.retire(id);
            }
        }
    }

    /// Captures the descriptors of `set`, pinning their slots until the snapshot is dropped.
    pub fn snapshot_for(self: &Arc<Self>, set: vk::DescriptorSet) -> DescriptorSetSnapshot {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut bindings: BTreeMap<u32, BindingSnapshot> = BTreeMap::new();
        let mut pinned = Vec::new();

        if let Some(set_state) = state.sets.get(&set) {
            if let Some(layout) = &set_state.layout {
                for (&binding, &count) in layout {
                    bindings.insert(
                        binding,
                        BindingSnapshot {
                            descriptors: vec![None; count as usize],
                        },
                    );
                }
            }

            let has_layout = set_state.layout.is_some();

            for (&(binding, array_element), &id) in &set_state.descriptors {
                let Some(slot) = state.slots.get_mut(id) else {
                    continue;
                };

                let descriptors = &mut bindings
                    .entry(binding)
                    .or_insert_with(|| BindingSnapshot {
                        descriptors: Vec::new(),
                    })
                    .descriptors;

                if descriptors.len() <= array_element as usize {
                    // Writes past the end of a known layout are not tracked.
                    if has_layout {
                        continue;
                    }

                    descriptors.resize(array_element as usize + 1, None);
                }

                slot.pins += 1;
                pinned.push(id);
                descriptors[array_element as usize] = Some(SnapshotEntry {
                    slot: id.index(),
                    tag: id.tag(),
                    bounds: slot.bounds,
                    valid: slot.valid,
                });
            }
        }

        DescriptorSetSnapshot {
            set,
            bindings,
            pins: HeapPins {
                heap: self.clone(),
                slots: pinned,
            },
        }
    }

    /// Called when a submission is made. Returns its serial.
    pub fn advance_serial(&self) -> u64 {
        let mut state = self.state.lock();
        state.submitted += 1;

        state.submitted
    }

    /// Called when every submission up to `serial` has completed. Reclaims the retired slots no
    /// snapshot pins anymore.
    pub fn retire_completed(&self, serial: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(serial);
        state.reclaim();
    }

    /// Registers a buffer device address range that accesses may fall in.
    pub fn register_address_range(
        &self,
        start: u64,
        size: DeviceSize,
    ) -> Result<(), GpuavError> {
        let mut state = self.state.lock();

        if state.addresses.len() >= self.address_capacity as usize {
            return Err(GpuavError::ResourceExhausted {
                resource: ExhaustedResource::AddressTableEntries,
            });
        }

        let range = AddressRange {
            start,
            end: start.saturating_add(size),
        };
        let index = state.addresses.partition_point(|r| *r < range);
        state.addresses.insert(index, range);
        self.write_address_table(&state.addresses);

        Ok(())
    }

    /// Removes the range starting at `start`.
    ///
    /// Commands in flight may still observe the old table; accesses to the removed range are
    /// then reported as out of bounds or not depending on timing.
    pub fn unregister_address_range(&self, start: u64) {
        let mut state = self.state.lock();

        if let Some(index) = state.addresses.iter().position(|range| range.start == start) {
            state.addresses.remove(index);
            self.write_address_table(&state.addresses);
        }
    }

    /// Returns whether the table has at least one range, i.e. whether address checks can pass.
    pub fn has_address_ranges(&self) -> bool {
        !self.state.lock().addresses.is_empty()
    }

    fn write_entry(&self, id: SlotId, bounds: &DescriptorBounds, valid: bool) {
        let mut words = [0; HEAP_ENTRY_WORDS as usize];
        words[heap_word::STATE as usize] = id.tag() << 1 | u32::from(valid);
        words[heap_word::KIND as usize] = bounds.kind as u32;
        words[heap_word::OFFSET as usize] = bounds.offset as u32;
        words[heap_word::SIZE as usize] = u32::try_from(bounds.size).unwrap_or(u32::MAX);

        let offset = id.index() as usize * HEAP_ENTRY_WORDS as usize;

        if valid {
            self.entries.write_words(offset, &words);
        } else {
            // Pending commands may be reading the entry: only the state word changes.
            self.entries
                .write_words(offset + heap_word::STATE as usize, &words[..1]);
        }
    }

    fn write_address_table(&self, ranges: &[AddressRange]) {
        let mut words = Vec::with_capacity(1 + ranges.len() * ADDRESS_ENTRY_WORDS as usize);
        words.push(ranges.len() as u32);

        for range in ranges {
            words.extend_from_slice(&[
                range.start as u32,
                (range.start >> 32) as u32,
                range.end as u32,
                (range.end >> 32) as u32,
            ]);
        }

        self.address_table.write_words(0, &words);
    }
}

impl HeapState {
    fn retire(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.retired_at = Some(self.submitted);
            self.retired.push(id);
        }
    }

    fn reclaim(&mut self) {
        let completed = self.completed;
        let slots = &mut self.slots;
        let resources = &mut self.resources;

        self.retired.retain(|&id| {
            let Some(slot) = slots.get(id) else {
                return false;
            };

            let reclaimable =
                slot.pins == 0 && slot.retired_at.is_some_and(|serial| serial <= completed);

            if reclaimable {
                if let Some(resource) = slot.bounds.resource {
                    if let Some(ids) = resources.get_mut(&resource) {
                        ids.retain(|other| *other != id);

                        if ids.is_empty() {
                            resources.remove(&resource);
                        }
                    }
                }

                slots.remove(id);
            }

            !reclaimable
        });
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        // SAFETY: The heap is only dropped once every command resource referencing it, and
        // thus every submission reading it, is gone.
        let entries = unsafe { ManuallyDrop::take(&mut self.entries) };
        // SAFETY: Same as above.
        let address_table = unsafe { ManuallyDrop::take(&mut self.address_table) };

        // SAFETY: See above.
        unsafe { self.device.destroy_buffer(entries) };
        // SAFETY: See above.
        unsafe { self.device.destroy_buffer(address_table) };
    }
}

/// The flattened binding table of the descriptor sets bound for one command.
///
/// ```text
/// [0]                set count
/// [1 + set]          offset of the set's table, 0 if the set isn't tracked
/// set table:         [0] binding count, [1 + binding] offset of the binding's array, or 0
/// binding array:     [0] descriptor count, then per descriptor {slot + 1 or 0, tag}
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingTable {
    words: Vec<u32>,
}

impl BindingTable {
    /// Flattens `snapshots`, each paired with the set index it is bound at. Returns `None` if
    /// the table would exceed `max_words`.
    pub fn build(
        snapshots: &[(u32, &DescriptorSetSnapshot)],
        max_words: usize,
    ) -> Option<Self> {
        let set_count = snapshots
            .iter()
            .map(|&(index, _)| index + 1)
            .max()
            .unwrap_or(0);
        let mut words = vec![0; 1 + set_count as usize];
        words[0] = set_count;

        for &(index, snapshot) in snapshots {
            let binding_count = snapshot
                .bindings
                .keys()
                .next_back()
                .map_or(0, |&binding| binding + 1);
            let set_offset = words.len();
            words[1 + index as usize] = set_offset as u32;
            words.push(binding_count);
            words.resize(set_offset + 1 + binding_count as usize, 0);

            for (&binding, binding_snapshot) in &snapshot.bindings {
                let array_offset = words.len();
                words[set_offset + 1 + binding as usize] = array_offset as u32;
                words.push(binding_snapshot.descriptors.len() as u32);

                for descriptor in &binding_snapshot.descriptors {
                    match descriptor {
                        Some(entry) => words.extend_from_slice(&[entry.slot + 1, entry.tag]),
                        None => words.extend_from_slice(&[0, 0]),
                    }
                }

                if words.len() > max_words {
                    return None;
                }
            }
        }

        (words.len() <= max_words).then_some(BindingTable { words })
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Whether no set is tracked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.first().map_or(true, |&count| count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockDevice;
    use ash::vk::Handle;

    fn heap(slots: u32) -> Arc<DescriptorHeap> {
        DescriptorHeap::new(Arc::new(MockDevice::new()), slots, 4).unwrap()
    }

    fn storage(size: DeviceSize, resource: u64) -> DescriptorBounds {
        DescriptorBounds {
            kind: DescriptorKind::StorageBuffer,
            offset: 0,
            size,
            resource: Some(resource),
        }
    }

    fn binding(set: u64, binding: u32, array_element: u32) -> DescriptorBinding {
        DescriptorBinding {
            set: vk::DescriptorSet::from_raw(set),
            binding,
            array_element,
        }
    }

    #[test]
    fn upsert_writes_a_fresh_slot() {
        let heap = heap(8);
        heap.upsert(binding(1, 0, 0), storage(64, 100)).unwrap();

        let first = heap.snapshot_for(vk::DescriptorSet::from_raw(1));
        let entry = *first.descriptor(0, 0).unwrap();
        assert_eq!(entry.bounds.size, 64);
        assert!(entry.valid);

        let offset = entry.slot as usize * HEAP_ENTRY_WORDS as usize;
        let mut words = [0; 4];
        heap.entries().read_words(offset, &mut words);
        assert_eq!(words, [entry.tag << 1 | 1, DescriptorKind::StorageBuffer as u32, 0, 64]);

        heap.upsert(binding(1, 0, 0), storage(128, 101)).unwrap();
        let second = heap.snapshot_for(vk::DescriptorSet::from_raw(1));
        assert_ne!(second.descriptor(0, 0).unwrap().slot, entry.slot);

        // The replaced slot is untouched.
        heap.entries().read_words(offset, &mut words);
        assert_eq!(words[3], 64);
    }

    #[test]
    fn retired_slots_wait_for_completion_and_pins() {
        let heap = heap(2);
        heap.upsert(binding(1, 0, 0), storage(64, 100)).unwrap();
        let snapshot = heap.snapshot_for(vk::DescriptorSet::from_raw(1));
        let serial = heap.advance_serial();

        heap.upsert(binding(1, 0, 0), storage(64, 101)).unwrap();
        assert_eq!(heap.occupied_slots(), 2);

        // Both slots are taken: the retired one is pinned and its submission is pending.
        assert!(matches!(
            heap.upsert(binding(1, 1, 0), storage(64, 102)),
            Err(GpuavError::ResourceExhausted {
                resource: ExhaustedResource::DescriptorHeapSlots,
            }),
        ));

        heap.retire_completed(serial);
        assert_eq!(heap.occupied_slots(), 2);

        drop(snapshot);
        heap.upsert(binding(1, 1, 0), storage(64, 102)).unwrap();
        assert_eq!(heap.occupied_slots(), 2);
    }

    #[test]
    fn invalidate_clears_the_valid_bit_in_place() {
        let heap = heap(8);
        heap.upsert(binding(1, 0, 0), storage(64, 100)).unwrap();
        heap.upsert(binding(1, 0, 1), storage(64, 100)).unwrap();
        heap.upsert(binding(1, 1, 0), storage(32, 200)).unwrap();

        let before = heap.snapshot_for(vk::DescriptorSet::from_raw(1));
        heap.invalidate_resource(100);
        let after = heap.snapshot_for(vk::DescriptorSet::from_raw(1));

        for element in 0..2 {
            let entry = after.descriptor(0, element).unwrap();
            assert!(!entry.valid);
            assert_eq!(entry.slot, before.descriptor(0, element).unwrap().slot);
            let state = heap
                .entries()
                .read_word(entry.slot as usize * HEAP_ENTRY_WORDS as usize);
            assert_eq!(state & 1, 0);
        }

        assert!(after.descriptor(1, 0).unwrap().valid);

        heap.invalidate(binding(1, 1, 0));
        let last = heap.snapshot_for(vk::DescriptorSet::from_raw(1));
        assert!(!last.descriptor(1, 0).unwrap().valid);
    }

    #[test]
    fn binding_table_layout() {
        let heap = heap(8);
        let set = vk::DescriptorSet::from_raw(7);
        heap.register_set(set, &[(0, 1), (2, 3)]);
        heap.upsert(binding(7, 2, 1), storage(16, 1)).unwrap();

        let snapshot = heap.snapshot_for(set);
        let entry = *snapshot.descriptor(2, 1).unwrap();
        let table = BindingTable::build(&[(1, &snapshot)], 1024).unwrap();
        let words = table.words();

        // Two sets, set 0 untracked.
        assert_eq!(&words[..3], &[2, 0, 3]);
        // Set 1: three bindings, binding 1 absent.
        assert_eq!(words[3], 3);
        assert_eq!(words[5], 0);
        let binding_2 = words[6] as usize;
        assert_eq!(words[binding_2], 3);
        assert_eq!(&words[binding_2 + 1..binding_2 + 3], &[0, 0]);
        assert_eq!(
            &words[binding_2 + 3..binding_2 + 5],
            &[entry.slot + 1, entry.tag],
        );

        assert!(BindingTable::build(&[(1, &snapshot)], 8).is_none());
    }

    #[test]
    fn address_table() {
        let heap = heap(1);
        heap.register_address_range(0x1_0000_0000, 0x100).unwrap();
        heap.register_address_range(0x1000, 0x10).unwrap();

        let mut words = [0; 9];
        heap.address_table().read_words(0, &mut words);
        assert_eq!(words, [2, 0x1000, 0, 0x1010, 0, 0, 1, 0x100, 1]);

        heap.unregister_address_range(0x1000);
        assert_eq!(heap.address_table().read_word(0), 1);
        assert_eq!(heap.address_table().read_word(1), 0);
    }
}
