use std::collections::HashMap;

use chat_api::Message;

/// Result of reconciling a provisional message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The confirmed message took the provisional slot.
    InPlace,
    /// A refresh had already delivered the confirmed message; the provisional
    /// entry was dropped.
    AlreadyPresent,
    /// The provisional entry no longer exists (log was cleared).
    Missing,
}

/// Ordered message log keyed by message id.
///
/// Entries live in slots addressed through an id index, so replacing an entry
/// keeps its position. Removal leaves a tombstone that is compacted once
/// tombstones outnumber live entries.
#[derive(Debug, Default)]
pub struct MessageLog {
    slots: Vec<Option<Message>>,
    index: HashMap<String, usize>,
    tombstones: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.slots.iter().flatten()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).and_then(|&i| self.slots[i].as_ref())
    }

    /// Visible position of a message.
    pub fn position(&self, id: &str) -> Option<usize> {
        let slot = *self.index.get(id)?;
        Some(self.slots[..slot].iter().flatten().count())
    }

    /// Append a message. Returns false if the id is already present.
    pub fn push(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.slots.len());
        self.slots.push(Some(message));
        true
    }

    /// Replace the provisional entry `provisional_id` by `confirmed`.
    pub fn reconcile(&mut self, provisional_id: &str, confirmed: Message) -> Reconciled {
        let Some(slot) = self.index.remove(provisional_id) else {
            return Reconciled::Missing;
        };
        if self.index.contains_key(&confirmed.id) {
            self.slots[slot] = None;
            self.tombstones += 1;
            self.maybe_compact();
            return Reconciled::AlreadyPresent;
        }
        self.index.insert(confirmed.id.clone(), slot);
        self.slots[slot] = Some(confirmed);
        Reconciled::InPlace
    }

    /// Apply `f` to the entry with `id`, keeping its key and position.
    pub fn update<F: FnOnce(&mut Message)>(&mut self, id: &str, f: F) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        match self.slots[slot].as_mut() {
            Some(message) => {
                f(message);
                debug_assert_eq!(message.id, id);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let slot = self.index.remove(id)?;
        let removed = self.slots[slot].take();
        self.tombstones += 1;
        self.maybe_compact();
        removed
    }

    /// Replace the confirmed contents wholesale with the server's log.
    /// Provisional entries still awaiting acknowledgement are kept after the
    /// server messages so their sends can still resolve.
    pub fn replace_confirmed(&mut self, server: Vec<Message>) {
        let pending: Vec<Message> = self
            .slots
            .drain(..)
            .flatten()
            .filter(|m| m.is_provisional())
            .collect();
        self.index.clear();
        self.tombstones = 0;
        for message in server.into_iter().chain(pending) {
            self.push(message);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.tombstones = 0;
    }

    fn maybe_compact(&mut self) {
        if self.tombstones <= self.len() {
            return;
        }
        let live: Vec<Message> = self.slots.drain(..).flatten().collect();
        self.clear();
        for message in live {
            self.push(message);
        }
    }
}
