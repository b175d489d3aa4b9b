//! Client storage with separate administrative and real-time access paths.
//!
//! The table is a fixed array of slots. A client is placed by linear probing
//! from `client_id % capacity` and stays in that slot until it disconnects, so
//! every lookup visits at most `capacity` slots. Each slot holds its record
//! behind an `ArcSwapOption`, so the IO cycle reads a complete record without
//! locking while administrative updates replace the record wholesale.
//! Administrative mutation is serialised by `admin`, which also owns the
//! graveyard for retired records and buffers.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::ClientRecord;
use crate::error::{EngineError, EngineResult};
use crate::reclaim::Graveyard;
use crate::ring::RoutingBuffer;

struct ClientSlot {
    record: ArcSwapOption<ClientRecord>,
    routing: ArcSwapOption<RoutingBuffer>,
}

impl ClientSlot {
    fn empty() -> Self {
        Self {
            record: ArcSwapOption::empty(),
            routing: ArcSwapOption::empty(),
        }
    }

    fn holds(&self, client_id: u32) -> bool {
        self.record
            .load()
            .as_ref()
            .is_some_and(|record| record.client_id() == client_id)
    }
}

#[derive(Default)]
struct TableAdmin {
    len: usize,
    graveyard: Graveyard,
}

/// Concurrency-safe map of client id to [`ClientRecord`].
pub struct ClientTable {
    slots: Box<[ClientSlot]>,
    admin: Mutex<TableAdmin>,
    routing_buffer_frames: usize,
}

impl ClientTable {
    /// Table with `capacity` slots whose routing buffers hold `routing_buffer_frames`.
    pub fn new(capacity: usize, routing_buffer_frames: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| ClientSlot::empty()).collect();
        Self {
            slots,
            admin: Mutex::new(TableAdmin::default()),
            routing_buffer_frames,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot indices to try for `client_id`, starting at its home slot.
    fn candidate_slots(&self, client_id: u32) -> impl Iterator<Item = usize> {
        let capacity = self.slots.len();
        let home = client_id as usize % capacity;
        (0..capacity).map(move |step| (home + step) % capacity)
    }

    // ---- administrative path -------------------------------------------------

    /// Insert a client. Re-adding a connected id replaces its record.
    ///
    /// Fails only when every slot holds another live client.
    pub fn add_client(&self, record: ClientRecord) -> EngineResult<()> {
        let client_id = record.client_id();
        let mut admin = self.admin.lock();

        if let Some(index) = self.find_slot(client_id) {
            let slot = &self.slots[index];
            if let Some(existing) = slot.record.swap(Some(Arc::new(record))) {
                admin.graveyard.retire(existing);
            }
            debug!(client_id, slot = index, "client replaced");
            return Ok(());
        }

        let index = self
            .candidate_slots(client_id)
            .find(|&index| self.slots[index].record.load().is_none())
            .ok_or(EngineError::TableFull {
                capacity: self.slots.len(),
            })?;
        self.slots[index].record.store(Some(Arc::new(record)));
        admin.len += 1;
        debug!(client_id, slot = index, "client stored");
        Ok(())
    }

    /// Remove a client, releasing its routing buffer. Returns the last record.
    pub fn remove_client(&self, client_id: u32) -> EngineResult<ClientRecord> {
        let mut admin = self.admin.lock();
        let slot = self.live_slot(client_id)?;
        let Some(record) = slot.record.swap(None) else {
            return Err(EngineError::InvalidClient(client_id));
        };
        admin.len -= 1;
        if let Some(buffer) = slot.routing.swap(None) {
            admin.graveyard.retire(buffer);
        }
        let last = (*record).clone();
        admin.graveyard.retire(record);
        Ok(last)
    }
    /// Copy of a client's record.
    pub fn client(&self, client_id: u32) -> EngineResult<ClientRecord> {
        self.live_slot(client_id)?
            .record
            .load_full()
            .map(|record| (*record).clone())
            .ok_or(EngineError::InvalidClient(client_id))
    }

    /// Copies of every connected client's record, ordered by client id.
    pub fn clients(&self) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> = self
            .slots
            .iter()
            .filter_map(|slot| slot.record.load_full())
            .map(|record| (*record).clone())
            .collect();
        records.sort_by_key(ClientRecord::client_id);
        records
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.admin.lock().len
    }

    /// True when no client is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `update` to a copy of one record and publish it if anything changed.
    pub fn update_client(
        &self,
        client_id: u32,
        update: impl FnOnce(&mut ClientRecord),
    ) -> EngineResult<bool> {
        let mut admin = self.admin.lock();
        let slot = self.live_slot(client_id)?;
        let current = slot
            .record
            .load_full()
            .ok_or(EngineError::InvalidClient(client_id))?;
        Ok(Self::replace_if_changed(slot, current, update, &mut admin.graveyard))
    }

    /// Apply `update` to every client whose pid or bundle id matches.
    /// Returns the number of records that changed.
    pub fn update_matching(
        &self,
        process_id: Option<i32>,
        bundle_id: Option<&str>,
        mut update: impl FnMut(&mut ClientRecord),
    ) -> usize {
        self.update_where(|record| record.matches(process_id, bundle_id), &mut update)
    }

    /// Apply `update` to every client. Returns the number of records that changed.
    pub fn update_all(&self, mut update: impl FnMut(&mut ClientRecord)) -> usize {
        self.update_where(|_| true, &mut update)
    }

    fn update_where(
        &self,
        filter: impl Fn(&ClientRecord) -> bool,
        update: &mut dyn FnMut(&mut ClientRecord),
    ) -> usize {
        let mut admin = self.admin.lock();
        let mut changed = 0;
        for slot in self.slots.iter() {
            let Some(current) = slot.record.load_full() else {
                continue;
            };
            if !filter(&current) {
                continue;
            }
            if Self::replace_if_changed(slot, current, &mut *update, &mut admin.graveyard) {
                changed += 1;
            }
        }
        changed
    }

    fn replace_if_changed(
        slot: &ClientSlot,
        current: Arc<ClientRecord>,
        update: impl FnOnce(&mut ClientRecord),
        graveyard: &mut Graveyard,
    ) -> bool {
        let mut next = (*current).clone();
        update(&mut next);
        if next == *current {
            return false;
        }
        slot.record.store(Some(Arc::new(next)));
        graveyard.retire(current);
        true
    }

    /// Allocate the client's routing buffer if it has none. Returns true if allocated.
    pub fn ensure_routing_buffer(&self, client_id: u32) -> EngineResult<bool> {
        let _admin = self.admin.lock();
        let slot = self.live_slot(client_id)?;
        if slot.routing.load().is_some() {
            return Ok(false);
        }
        slot.routing
            .store(Some(Arc::new(RoutingBuffer::new(self.routing_buffer_frames))));
        debug!(client_id, frames = self.routing_buffer_frames, "routing buffer allocated");
        Ok(true)
    }

    /// Drop the client's routing buffer. Returns true if one was released.
    pub fn release_routing_buffer(&self, client_id: u32) -> EngineResult<bool> {
        let mut admin = self.admin.lock();
        let slot = self.live_slot(client_id)?;
        match slot.routing.swap(None) {
            Some(buffer) => {
                admin.graveyard.retire(buffer);
                debug!(client_id, "routing buffer released");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the client currently owns a routing buffer.
    pub fn has_routing_buffer(&self, client_id: u32) -> bool {
        self.live_slot(client_id)
            .map(|slot| slot.routing.load().is_some())
            .unwrap_or(false)
    }

    fn live_slot(&self, client_id: u32) -> EngineResult<&ClientSlot> {
        self.find_slot(client_id)
            .map(|index| &self.slots[index])
            .ok_or(EngineError::InvalidClient(client_id))
    }

    fn find_slot(&self, client_id: u32) -> Option<usize> {
        self.candidate_slots(client_id)
            .find(|&index| self.slots[index].holds(client_id))
    }

    // ---- real-time path ------------------------------------------------------
    //
    // None of these lock or allocate. A record read here may be at most one
    // administrative update stale, but is always a complete record.

    /// Whether a client is connected, with its current record.
    pub fn get_client_rt(&self, client_id: u32) -> Option<Arc<ClientRecord>> {
        self.client_slot_rt(client_id).map(|(_, record)| record)
    }

    /// Slot index and current record of a connected client.
    ///
    /// Clients never move while connected, so the index stays valid until the
    /// client is removed.
    pub fn client_slot_rt(&self, client_id: u32) -> Option<(usize, Arc<ClientRecord>)> {
        self.candidate_slots(client_id).find_map(|index| {
            let guard = self.slots[index].record.load();
            match &*guard {
                Some(record) if record.client_id() == client_id => {
                    Some((index, Arc::clone(record)))
                }
                _ => None,
            }
        })
    }

    /// First connected client owned by `process_id`.
    pub fn get_client_by_pid_rt(&self, process_id: i32) -> Option<Arc<ClientRecord>> {
        self.client_by_pid_rt(process_id).map(|(_, record)| record)
    }

    /// Slot index and record of the first connected client owned by `process_id`.
    pub(crate) fn client_by_pid_rt(&self, process_id: i32) -> Option<(usize, Arc<ClientRecord>)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let guard = slot.record.load();
            match &*guard {
                Some(record) if record.process_id() == process_id => {
                    Some((index, Arc::clone(record)))
                }
                _ => None,
            }
        })
    }

    /// Run `f` against the routing buffer of the client in `slot_index`, if any.
    pub(crate) fn with_routing_buffer_rt<R>(
        &self,
        slot_index: usize,
        f: impl FnOnce(&RoutingBuffer) -> R,
    ) -> Option<R> {
        let slot = self.slots.get(slot_index)?;
        let guard = slot.routing.load();
        guard.as_deref().map(f)
    }
}
