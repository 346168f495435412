use std::collections::VecDeque;
use std::os::fd::RawFd;

use crate::core::channel::{Channel, ChannelHandle, ChannelRole};
use crate::core::token::GEN_MASK;
use crate::error::{Error, Result};

struct Slot {
    generation: u32,
    channel: Option<Channel>,
}

/// Channel arena using slab allocation with a freelist
///
/// Slots are reused, and every reuse bumps the slot's generation so handles
/// from an earlier occupant stop resolving.
pub struct ChannelArena {
    slots: Vec<Slot>,
    freelist: VecDeque<u32>,
    capacity: usize,
    live: usize,
}

impl ChannelArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(1024)),
            freelist: VecDeque::new(),
            capacity,
            live: 0,
        }
    }

    pub fn insert(&mut self, fd: RawFd, role: ChannelRole) -> Result<ChannelHandle> {
        if self.live >= self.capacity {
            return Err(Error::ResourceExhausted {
                resource: "channel arena",
                limit: self.capacity,
            });
        }

        let index = match self.freelist.pop_front() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    channel: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = (slot.generation + 1) & GEN_MASK as u32;
        let handle = ChannelHandle {
            index,
            generation: slot.generation,
        };
        slot.channel = Some(Channel::new(handle, fd, role));
        self.live += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: ChannelHandle) -> Option<&Channel> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.channel.as_ref())
    }

    pub fn get_mut(&mut self, handle: ChannelHandle) -> Option<&mut Channel> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.channel.as_mut())
    }

    /// Take the channel out; the slot goes back on the freelist.
    pub fn remove(&mut self, handle: ChannelHandle) -> Option<Channel> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let channel = slot.channel.take()?;
        self.freelist.push_back(handle.index);
        self.live -= 1;
        Some(channel)
    }

    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.slots
            .iter()
            .filter_map(|s| s.channel.as_ref().map(|c| c.handle))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
