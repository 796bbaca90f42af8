//! Device-scoped local-id ↔ global-id table (spec §3, §4.4, §4.6).
//!
//! An id-map record lets two peers agree on which instance a value belongs
//! to. It stays alive as long as either the local or the remote side still
//! references it (`local_refcount`/`global_refcount`); it is freed — and
//! only then — once both reach zero (spec §3 invariant 6).

pub type Lid = i64;
/// A global instance id; once nonzero its high 32 bits are the activating
/// device's id (spec §3 invariant 5).
pub type Gid = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMapEntry {
    pub lid: Lid,
    pub gid: Gid,
    pub local_refcount: u32,
    pub global_refcount: u32,
    pub released_locally: bool,
    pub released_remotely: bool,
}

impl IdMapEntry {
    fn is_live(&self) -> bool {
        self.local_refcount > 0 || self.global_refcount > 0
    }
}

/// Pooled allocation discipline (spec §5): the free list starts at
/// `num_instances` capacity and grows by doubling when `activate` finds it
/// empty.
#[derive(Default)]
pub struct IdMapTable {
    active: Vec<IdMapEntry>,
    initial_capacity: usize,
}

impl IdMapTable {
    pub fn new(num_instances: usize) -> Self {
        Self {
            active: Vec::with_capacity(num_instances.max(1)),
            initial_capacity: num_instances.max(1),
        }
    }

    /// Activate a local instance with a freshly allocated (or peer-supplied)
    /// global id. Grows the backing storage by doubling if it is at
    /// capacity, mirroring the reserve-list refill rule in spec §5.
    pub fn activate(&mut self, lid: Lid, gid: Gid) -> &IdMapEntry {
        if self.active.len() == self.active.capacity() {
            let grown = (self.active.capacity() * 2).max(self.initial_capacity);
            self.active.reserve(grown - self.active.capacity());
        }
        self.active.push(IdMapEntry {
            lid,
            gid,
            local_refcount: 1,
            global_refcount: 0,
            released_locally: false,
            released_remotely: false,
        });
        self.active.last().unwrap()
    }

    pub fn find_by_lid(&self, lid: Lid) -> Option<&IdMapEntry> {
        self.active.iter().find(|e| e.lid == lid)
    }

    pub fn find_by_lid_mut(&mut self, lid: Lid) -> Option<&mut IdMapEntry> {
        self.active.iter_mut().find(|e| e.lid == lid)
    }

    pub fn find_by_gid(&self, gid: Gid) -> Option<&IdMapEntry> {
        self.active.iter().find(|e| e.gid == gid)
    }

    pub fn find_by_gid_mut(&mut self, gid: Gid) -> Option<&mut IdMapEntry> {
        self.active.iter_mut().find(|e| e.gid == gid)
    }

    /// Increment the remote reference count, e.g. when a peer's map slot
    /// starts tracking this instance.
    pub fn incref_global(&mut self, lid: Lid) {
        if let Some(e) = self.find_by_lid_mut(lid) {
            e.global_refcount += 1;
        }
    }

    pub fn decref_global(&mut self, lid: Lid) {
        if let Some(e) = self.find_by_lid_mut(lid) {
            e.global_refcount = e.global_refcount.saturating_sub(1);
        }
        self.reap();
    }

    pub fn release_locally(&mut self, lid: Lid) {
        if let Some(e) = self.find_by_lid_mut(lid) {
            e.released_locally = true;
            e.local_refcount = e.local_refcount.saturating_sub(1);
        }
        self.reap();
    }

    pub fn release_remotely(&mut self, gid: Gid) {
        if let Some(e) = self.find_by_gid_mut(gid) {
            e.released_remotely = true;
            e.global_refcount = e.global_refcount.saturating_sub(1);
        }
        self.reap();
    }

    /// Drop any entry whose both refcounts have reached zero.
    fn reap(&mut self) {
        self.active.retain(|e| e.is_live());
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdMapEntry> {
        self.active.iter()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// `device_id << 32` composed with a per-device monotonic counter, the
/// standard global-id allocation scheme (spec §3 invariant 5).
pub fn make_gid(device_id: u32, local_counter: u32) -> Gid {
    ((device_id as u64) << 32) | (local_counter as u64)
}

pub fn gid_origin_device(gid: Gid) -> u32 {
    (gid >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_only_when_both_refcounts_zero() {
        let mut table = IdMapTable::new(4);
        table.activate(1, make_gid(7, 1));
        assert_eq!(table.len(), 1);
        table.incref_global(1);
        table.release_locally(1);
        assert_eq!(table.len(), 1, "global refcount still positive");
        table.decref_global(1);
        assert_eq!(table.len(), 0, "both refcounts now zero");
    }

    #[test]
    fn gid_embeds_origin_device() {
        let gid = make_gid(42, 9);
        assert_eq!(gid_origin_device(gid), 42);
    }
}
