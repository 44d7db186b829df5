//! # Handle Registry
//!
//! Generational handles standing in for native object pointers.
//!
//! Hosts, peers and packets live in native memory. The bridge never hands
//! those pointers out; instead each live object occupies a slot in a
//! [`Registry`] and the caller receives a [`Handle`] naming the slot and the
//! generation it was issued under. Destroying an object bumps the slot's
//! generation, so any copy of the old handle is detected as stale instead of
//! reaching a dangling pointer.
//!
//! ## Token Layout
//! ```text
//! [generation(32)] [slot index(32)]   generation >= 1, so a live token is never 0
//! ```
//!
//! The value `0` is the null handle: "no object". It is never issued and
//! never resolves.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// The three kinds of native object the bridge tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Host,
    Peer,
    Packet,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Host => "host",
            ResourceKind::Peer => "peer",
            ResourceKind::Packet => "packet",
        })
    }
}

/// Type-level tag tying a handle to its resource kind.
pub trait Kind {
    const KIND: ResourceKind;
}

#[derive(Debug)]
pub enum HostKind {}
#[derive(Debug)]
pub enum PeerKind {}
#[derive(Debug)]
pub enum PacketKind {}

impl Kind for HostKind {
    const KIND: ResourceKind = ResourceKind::Host;
}
impl Kind for PeerKind {
    const KIND: ResourceKind = ResourceKind::Peer;
}
impl Kind for PacketKind {
    const KIND: ResourceKind = ResourceKind::Packet;
}

pub type HostHandle = Handle<HostKind>;
pub type PeerHandle = Handle<PeerKind>;
pub type PacketHandle = Handle<PacketKind>;

/// Opaque token for a registry slot.
///
/// Handles are `Copy`; copying one never extends the object's lifetime.
/// Use [`Handle::to_raw`] / [`Handle::from_raw`] to move a handle across a
/// boundary that only understands integers.
pub struct Handle<K> {
    token: u64,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    /// The null handle.
    pub const NULL: Self = Self::from_raw(0);

    pub const fn from_raw(token: u64) -> Self {
        Self {
            token,
            _kind: PhantomData,
        }
    }

    pub const fn to_raw(self) -> u64 {
        self.token
    }

    pub const fn is_null(self) -> bool {
        self.token == 0
    }

    fn new(index: u32, generation: u32) -> Self {
        Self::from_raw((u64::from(generation) << 32) | u64::from(index))
    }

    fn index(self) -> usize {
        (self.token & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.token >> 32) as u32
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<K: Kind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "{}(null)", K::KIND)
        } else {
            write!(f, "{}({}v{})", K::KIND, self.index(), self.generation())
        }
    }
}

impl<K: Kind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with generation counters.
///
/// Freed slots are reused, but always under a new generation.
pub struct Registry<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Kind, T> Registry<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _kind: PhantomData,
        }
    }

    /// Stores `value` and returns the handle naming it.
    pub fn insert(&mut self, value: T) -> Handle<K> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(index, 1)
    }

    pub fn get(&self, handle: Handle<K>) -> Result<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| !handle.is_null() && slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or(BridgeError::StaleHandle(K::KIND))
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| !handle.is_null() && slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or(BridgeError::StaleHandle(K::KIND))
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_ok()
    }

    /// Releases the slot. Every outstanding copy of `handle` becomes stale.
    pub fn remove(&mut self, handle: Handle<K>) -> Result<T> {
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index)
            .filter(|slot| !handle.is_null() && slot.generation == handle.generation())
            .ok_or(BridgeError::StaleHandle(K::KIND))?;
        let value = slot.value.take().ok_or(BridgeError::StaleHandle(K::KIND))?;

        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push(index as u32);
        self.live -= 1;
        Ok(value)
    }

    /// Removes every entry matching `pred`, returning them.
    pub fn extract_if<F>(&mut self, mut pred: F) -> Vec<(Handle<K>, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let doomed: Vec<Handle<K>> = self
            .iter()
            .filter(|(_, value)| pred(*value))
            .map(|(handle, _)| handle)
            .collect();

        doomed
            .into_iter()
            .filter_map(|handle| self.remove(handle).ok().map(|value| (handle, value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
