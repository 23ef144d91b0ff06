//! Connection storage: a generational slot arena plus intrusive lists
//! expressed as slot keys.
//!
//! Connections never move and are never referenced by pointer from daemon
//! bookkeeping; every membership (timeout order, epoll eready, cleanup) is a
//! pair of keys inside the connection itself. A stale key simply fails to
//! resolve once the slot's generation moves on.

use crate::conn::connection::Connection;

/// Generational handle to a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

impl ConnKey {
    /// Packs the key for an epoll data word.
    pub(crate) const fn pack(self) -> u64 {
        ((self.gen as u64) << 32) | self.index as u64
    }

    pub(crate) const fn unpack(word: u64) -> Self {
        Self {
            index: word as u32,
            gen: (word >> 32) as u32,
        }
    }
}

/// Public identifier of a live connection, as exposed through
/// [`Request::id`](crate::Request::id) for suspend/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub(crate) core: u32,
    pub(crate) key: ConnKey,
}

impl ConnectionId {
    #[cfg(test)]
    pub(crate) fn test_value() -> Self {
        Self {
            core: 0,
            key: ConnKey { index: 0, gen: 0 },
        }
    }
}

/// Which intrusive list a link pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    NormalTimeout = 0,
    ManualTimeout = 1,
    Eready = 2,
    Cleanup = 3,
}

pub(crate) const LIST_COUNT: usize = 4;

/// Link pair stored inside each connection, one per list.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    pub(crate) prev: Option<ConnKey>,
    pub(crate) next: Option<ConnKey>,
    pub(crate) member: bool,
}

struct Slot {
    gen: u32,
    conn: Option<Box<Connection>>,
}

/// Arena of connection slots owned by one daemon core.
pub(crate) struct SlotArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SlotArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn insert(&mut self, conn: Box<Connection>) -> ConnKey {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.conn = Some(conn);
                ConnKey {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { gen: 0, conn: Some(conn) });
                ConnKey { index, gen: 0 }
            }
        }
    }

    pub(crate) fn get(&self, key: ConnKey) -> Option<&Connection> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.gen != key.gen {
            return None;
        }
        slot.conn.as_deref()
    }

    pub(crate) fn get_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.gen != key.gen {
            return None;
        }
        slot.conn.as_deref_mut()
    }

    /// Removes the connection, bumping the slot generation so any
    /// outstanding key for it goes stale.
    pub(crate) fn remove(&mut self, key: ConnKey) -> Option<Box<Connection>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.gen != key.gen || slot.conn.is_none() {
            return None;
        }

        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        slot.conn.take()
    }

    /// Keys of all live connections, in slot order.
    pub(crate) fn keys(&self) -> Vec<ConnKey> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.conn.is_some())
            .map(|(i, s)| ConnKey {
                index: i as u32,
                gen: s.gen,
            })
            .collect()
    }
}

/// Doubly linked list over arena keys. The head is the most recently
/// touched end; expiry sweeps walk from the tail.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnList {
    id: ListId,
    head: Option<ConnKey>,
    tail: Option<ConnKey>,
    len: usize,
}

impl ConnList {
    pub(crate) fn new(id: ListId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn head(&self) -> Option<ConnKey> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<ConnKey> {
        self.tail
    }

    pub(crate) fn contains(&self, arena: &SlotArena, key: ConnKey) -> bool {
        arena.get(key).is_some_and(|c| c.links(self.id).member)
    }

    pub(crate) fn push_front(&mut self, arena: &mut SlotArena, key: ConnKey) {
        debug_assert!(!self.contains(arena, key));

        let old_head = self.head;
        {
            let conn = arena.get_mut(key).expect("stale key pushed");
            let links = conn.links_mut(self.id);
            links.prev = None;
            links.next = old_head;
            links.member = true;
        }

        match old_head {
            Some(head) => {
                arena
                    .get_mut(head)
                    .expect("list head stale")
                    .links_mut(self.id)
                    .prev = Some(key)
            }
            None => self.tail = Some(key),
        }
        self.head = Some(key);
        self.len += 1;
    }

    /// Detaches `key` if it is a member; harmless otherwise.
    pub(crate) fn unlink(&mut self, arena: &mut SlotArena, key: ConnKey) {
        let (prev, next) = match arena.get_mut(key) {
            Some(conn) => {
                let links = conn.links_mut(self.id);
                if !links.member {
                    return;
                }
                let out = (links.prev, links.next);
                *links = Links::default();
                out
            }
            None => return,
        };

        match prev {
            Some(p) => arena.get_mut(p).expect("list link stale").links_mut(self.id).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.get_mut(n).expect("list link stale").links_mut(self.id).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub(crate) fn move_to_front(&mut self, arena: &mut SlotArena, key: ConnKey) {
        if self.head == Some(key) {
            return;
        }
        self.unlink(arena, key);
        self.push_front(arena, key);
    }

    pub(crate) fn pop_front(&mut self, arena: &mut SlotArena) -> Option<ConnKey> {
        let key = self.head?;
        self.unlink(arena, key);
        Some(key)
    }

    /// Neighbor toward the head, captured before any mutation.
    pub(crate) fn prev_of(&self, arena: &SlotArena, key: ConnKey) -> Option<ConnKey> {
        arena.get(key).and_then(|c| c.links(self.id).prev)
    }
}
