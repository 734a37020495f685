// src/slab.rs

/// Handle into a [`Slab`]. The generation makes a key go stale once its
/// entry is removed, even if the slot is reused later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next: Option<u32> },
}

/// Fixed-capacity arena with an intrusive free list.
pub struct Slab<T> {
    entries: Box<[Entry<T>]>,
    head_free: Option<u32>,
    active_count: usize,
}

impl<T> Slab<T> {
    /// Allocate every slot strictly once, up front.
    pub fn new(capacity: usize) -> Self {
        let entries: Vec<Entry<T>> = (0..capacity)
            .map(|i| Entry::Free {
                generation: 0,
                // The last entry terminates the free list.
                next: if i + 1 == capacity { None } else { Some((i + 1) as u32) },
            })
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: if capacity == 0 { None } else { Some(0) },
            active_count: 0,
        }
    }

    /// O(1) allocation. Returns `None` when out of capacity.
    #[inline]
    pub fn insert(&mut self, value: T) -> Option<Key> {
        let index = self.head_free?;
        let entry = &mut self.entries[index as usize];

        let (generation, next) = match *entry {
            Entry::Free { generation, next } => (generation, next),
            Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
        };

        self.head_free = next;
        *entry = Entry::Occupied { generation, value };
        self.active_count += 1;
        Some(Key { index, generation })
    }

    /// O(1) deallocation. Stale or foreign keys are ignored.
    #[inline]
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let entry = self.entries.get_mut(key.index as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None, // Double free prevention
        }

        let old = std::mem::replace(
            entry,
            Entry::Free {
                generation: key.generation.wrapping_add(1),
                next: self.head_free,
            },
        );
        self.head_free = Some(key.index);
        self.active_count -= 1;

        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    #[inline]
    pub fn get(&self, key: Key) -> Option<&T> {
        match self.entries.get(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.entries.get_mut(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }
}
