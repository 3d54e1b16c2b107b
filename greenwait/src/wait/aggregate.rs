//! Flattened read/write/except arrays over every pending I/O wait.
//!
//! The arrays reference their owners by [`WaitHandle`] rather than writing
//! offsets into the descriptors, so a rebuild never invalidates anything a
//! descriptor holds.

use std::collections::HashMap;

use super::descriptor::{SetKind, WaitData};
use super::queue::{WaitHandle, WaitQueue};
use super::slot::FdSlot;

/// Where a descriptor's slots begin in each flattened array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Offsets {
    pub read: usize,
    pub write: usize,
    pub except: usize,
}

impl Offsets {
    pub fn of(&self, kind: SetKind) -> usize {
        match kind {
            SetKind::Read => self.read,
            SetKind::Write => self.write,
            SetKind::Except => self.except,
        }
    }
}

/// The descriptor slot a flattened entry was copied from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotRef {
    pub handle: WaitHandle,
    pub kind: SetKind,
    pub index: usize,
}

#[derive(Default)]
pub(crate) struct FdArrays {
    slots: [Vec<FdSlot>; 3],
    owners: [Vec<SlotRef>; 3],
    offsets: HashMap<WaitHandle, Offsets>,
}

impl FdArrays {
    /// Rebuilds all arrays from the pending set, in queue order.
    pub fn rebuild<O>(&mut self, queue: &WaitQueue<O>) {
        for kind in SetKind::ALL {
            self.slots[kind.index()].clear();
            self.owners[kind.index()].clear();
        }
        self.offsets.clear();

        for (handle, descriptor) in queue.iter() {
            let io = match descriptor.data() {
                WaitData::Io(io) => io,
                WaitData::Sleep => continue,
            };

            let mut offsets = Offsets::default();
            for kind in SetKind::ALL {
                let slots = &mut self.slots[kind.index()];
                let owners = &mut self.owners[kind.index()];
                match kind {
                    SetKind::Read => offsets.read = slots.len(),
                    SetKind::Write => offsets.write = slots.len(),
                    SetKind::Except => offsets.except = slots.len(),
                }
                for (index, slot) in io.set(kind).iter().enumerate() {
                    slots.push(*slot);
                    owners.push(SlotRef {
                        handle,
                        kind,
                        index,
                    });
                }
            }
            self.offsets.insert(handle, offsets);
        }
    }

    pub fn set(&self, kind: SetKind) -> &[FdSlot] {
        &self.slots[kind.index()]
    }

    pub fn offsets(&self, handle: WaitHandle) -> Option<Offsets> {
        self.offsets.get(&handle).copied()
    }

    /// Total number of slots across the three arrays.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Every flattened slot with its owner, read array first.
    pub fn iter(&self) -> impl Iterator<Item = (FdSlot, SlotRef)> + '_ {
        SetKind::ALL.into_iter().flat_map(move |kind| {
            let i = kind.index();
            self.slots[i].iter().copied().zip(self.owners[i].iter().copied())
        })
    }
}
