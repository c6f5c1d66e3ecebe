//! Guest-visible object identity.
//!
//! Every host object handed to the guest is wrapped in a registry slot and represented by an
//! opaque [`GuestHandle`]. The token encodes the slot index plus a generation, so unwrapping is a
//! bounds-checked array access and a token outlives neither its slot nor the registry's context.
//!
//! Token layout (`u64`):
//!
//! ```text
//! 63            32 31             0
//! +---------------+---------------+
//! |  generation   |   slot + 1    |
//! +---------------+---------------+
//! ```
//!
//! The low half is never zero, which keeps `0` free for [`GuestHandle::NULL`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::host::HostHandle;
use crate::sync::{read, write};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GuestHandle(u64);

impl GuestHandle {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn new(slot: usize, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | (slot as u64 + 1))
    }

    fn slot(self) -> Option<usize> {
        match self.0 as u32 {
            0 => None,
            low => Some(low as usize - 1),
        }
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for GuestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestHandle({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,
    Semaphore,
    DeviceMemory,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::PhysicalDevice => "physical-device",
            Self::Device => "device",
            Self::Queue => "queue",
            Self::CommandBuffer => "command-buffer",
            Self::Semaphore => "semaphore",
            Self::DeviceMemory => "device-memory",
        }
    }
}

/// Identity of a guest context (one per simulated process).
///
/// Keyed-mutex ownership is recorded by context id, so ids must be unique across every process
/// that may share a section: the high half is the OS process id, the low half a per-process
/// counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

impl ContextId {
    pub fn next() -> Self {
        let local = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        Self((u64::from(std::process::id()) << 32) | u64::from(local))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({:#x})", self.0)
    }
}

/// A virtualized object: host identity plus bookkeeping.
#[derive(Debug, Clone)]
pub struct Wrapper<P> {
    pub host: HostHandle,
    pub kind: ObjectKind,
    /// Back-reference to the parent object; never an owning pointer.
    pub parent: GuestHandle,
    pub payload: P,
}

struct Slot<P> {
    generation: u32,
    entry: Option<Wrapper<P>>,
}

struct Table<P> {
    slots: Vec<Slot<P>>,
    free: Vec<usize>,
    live: usize,
    closed: bool,
}

impl<P> Table<P> {
    fn entry(&self, handle: GuestHandle) -> Option<&Wrapper<P>> {
        let slot = self.slots.get(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: GuestHandle) -> Option<&mut Wrapper<P>> {
        let slot = self.slots.get_mut(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_mut()
    }

    fn take(&mut self, handle: GuestHandle) -> Option<Wrapper<P>> {
        let index = handle.slot()?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let wrapper = slot.entry.take()?;
        // Retire the token; the slot comes back with a new generation.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(wrapper)
    }

    fn handles(&self) -> impl Iterator<Item = (GuestHandle, &Wrapper<P>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|wrapper| (GuestHandle::new(index, slot.generation), wrapper))
        })
    }
}

type ReverseIndex = BTreeMap<(ObjectKind, HostHandle), GuestHandle>;

/// Per-context table of virtualized objects.
///
/// Lock order: `table` before `reverse`.
pub struct ObjectRegistry<P> {
    context: ContextId,
    table: RwLock<Table<P>>,
    reverse: RwLock<Option<ReverseIndex>>,
    always_track: bool,
}

impl<P: Clone> ObjectRegistry<P> {
    pub fn new(context: ContextId, always_track: bool) -> Self {
        Self {
            context,
            table: RwLock::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
                closed: false,
            }),
            reverse: RwLock::new(always_track.then(BTreeMap::new)),
            always_track,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn wrap(
        &self,
        host: HostHandle,
        kind: ObjectKind,
        parent: GuestHandle,
        payload: P,
    ) -> Result<GuestHandle> {
        let mut table = write(&self.table);
        if table.closed {
            return Err(BridgeError::ContextDestroyed);
        }
        if !parent.is_null() && table.entry(parent).is_none() {
            return Err(BridgeError::InvalidHandle(parent));
        }

        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                let index = table.slots.len();
                if index >= u32::MAX as usize - 1 {
                    return Err(BridgeError::TooManyObjects);
                }
                table
                    .slots
                    .try_reserve(1)
                    .map_err(|_| BridgeError::OutOfHostMemory)?;
                table.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                index
            }
        };

        let slot = &mut table.slots[index];
        slot.entry = Some(Wrapper {
            host,
            kind,
            parent,
            payload,
        });
        let handle = GuestHandle::new(index, slot.generation);
        table.live += 1;

        if let Some(reverse) = write(&self.reverse).as_mut() {
            reverse.insert((kind, host), handle);
        }
        Ok(handle)
    }

    pub fn unwrap(&self, handle: GuestHandle) -> Result<HostHandle> {
        self.with(handle, |wrapper| wrapper.host)
    }

    /// Like [`ObjectRegistry::unwrap`], additionally checking the object kind.
    pub fn unwrap_kind(&self, handle: GuestHandle, kind: ObjectKind) -> Result<HostHandle> {
        self.get(handle, kind).map(|wrapper| wrapper.host)
    }

    pub fn get(&self, handle: GuestHandle, kind: ObjectKind) -> Result<Wrapper<P>> {
        let table = read(&self.table);
        match table.entry(handle) {
            Some(wrapper) if wrapper.kind == kind => Ok(wrapper.clone()),
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    pub fn with<R>(&self, handle: GuestHandle, f: impl FnOnce(&Wrapper<P>) -> R) -> Result<R> {
        let table = read(&self.table);
        table
            .entry(handle)
            .map(f)
            .ok_or(BridgeError::InvalidHandle(handle))
    }

    /// Points a stable guest token at a different host object; returns the old host identity.
    pub fn rebind(&self, handle: GuestHandle, host: HostHandle) -> Result<HostHandle> {
        let mut table = write(&self.table);
        let wrapper = table
            .entry_mut(handle)
            .ok_or(BridgeError::InvalidHandle(handle))?;
        let old = std::mem::replace(&mut wrapper.host, host);
        let kind = wrapper.kind;

        if let Some(reverse) = write(&self.reverse).as_mut() {
            if reverse.get(&(kind, old)) == Some(&handle) {
                reverse.remove(&(kind, old));
            }
            reverse.insert((kind, host), handle);
        }
        Ok(old)
    }

    pub fn remove(&self, handle: GuestHandle) -> Result<Wrapper<P>> {
        let mut table = write(&self.table);
        let wrapper = table
            .take(handle)
            .ok_or(BridgeError::InvalidHandle(handle))?;
        self.unindex(handle, &wrapper);
        Ok(wrapper)
    }

    /// Direct children of `parent`.
    pub fn children(&self, parent: GuestHandle) -> Vec<GuestHandle> {
        let table = read(&self.table);
        table
            .handles()
            .filter(|(_, wrapper)| wrapper.parent == parent)
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Removes every descendant of `parent` (not `parent` itself), deepest objects first.
    pub fn remove_children(&self, parent: GuestHandle) -> Vec<(GuestHandle, Wrapper<P>)> {
        let mut table = write(&self.table);

        let mut order = vec![parent];
        let mut cursor = 0;
        while cursor < order.len() {
            let current = order[cursor];
            order.extend(
                table
                    .handles()
                    .filter(|(_, wrapper)| wrapper.parent == current)
                    .map(|(handle, _)| handle),
            );
            cursor += 1;
        }

        let removed: Vec<_> = order[1..]
            .iter()
            .rev()
            .filter_map(|&handle| table.take(handle).map(|wrapper| (handle, wrapper)))
            .collect();
        for (handle, wrapper) in &removed {
            self.unindex(*handle, wrapper);
        }
        removed
    }

    /// Marks the context destroyed and drains every object, deepest first. Later calls fail with
    /// [`BridgeError::ContextDestroyed`] or [`BridgeError::InvalidHandle`].
    pub fn close(&self) -> Vec<(GuestHandle, Wrapper<P>)> {
        let mut removed = self.remove_children(GuestHandle::NULL);
        let mut table = write(&self.table);
        table.closed = true;
        // Orphans whose parent token was never registered here.
        let stragglers: Vec<_> = table.handles().map(|(handle, _)| handle).collect();
        for handle in stragglers {
            if let Some(wrapper) = table.take(handle) {
                removed.push((handle, wrapper));
            }
        }
        if let Some(reverse) = write(&self.reverse).as_mut() {
            reverse.clear();
        }
        removed
    }

    pub fn len(&self) -> usize {
        read(&self.table).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Translates a host object to its guest token. Only answers while tracking is enabled.
    pub fn lookup_host(&self, kind: ObjectKind, host: HostHandle) -> Option<GuestHandle> {
        read(&self.reverse)
            .as_ref()
            .and_then(|reverse| reverse.get(&(kind, host)).copied())
    }

    pub fn is_tracking(&self) -> bool {
        read(&self.reverse).is_some()
    }

    /// Enables or disables the host → guest index. Enabling rebuilds it from the table.
    pub fn set_tracking(&self, enabled: bool) {
        let table = read(&self.table);
        let mut reverse = write(&self.reverse);
        if enabled {
            if reverse.is_none() {
                let index: ReverseIndex = table
                    .handles()
                    .map(|(handle, wrapper)| ((wrapper.kind, wrapper.host), handle))
                    .collect();
                debug!(
                    context = ?self.context,
                    objects = index.len(),
                    "object registry: reverse index rebuilt"
                );
                *reverse = Some(index);
            }
        } else if !self.always_track {
            *reverse = None;
        }
    }

    fn unindex(&self, handle: GuestHandle, wrapper: &Wrapper<P>) {
        if let Some(reverse) = write(&self.reverse).as_mut() {
            let key = (wrapper.kind, wrapper.host);
            if reverse.get(&key) == Some(&handle) {
                reverse.remove(&key);
            }
        }
    }
}
