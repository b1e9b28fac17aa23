//! Generational arena backing wrapper storage

/// Generational index of a wrapper.
///
/// This is what native objects store in their extra-data slot and what host
/// objects carry as their wrapped native value. A stale id never resolves to
/// a wrapper that later reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrapperId {
    index: u32,
    generation: u32,
}

impl WrapperId {
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant,
}

pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    /// Vacant slots, each with the id its next occupant gets
    free: Vec<WrapperId>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value built from the id it will occupy.
    ///
    /// If `build` fails nothing is inserted and the slot stays free.
    pub(crate) fn try_insert_with<E>(
        &mut self,
        build: impl FnOnce(WrapperId) -> Result<T, E>,
    ) -> Result<WrapperId, E> {
        let reused = self.free.last().copied();
        let id = reused.unwrap_or(WrapperId {
            index: self.entries.len() as u32,
            generation: 0,
        });
        let value = build(id)?;

        let entry = Entry::Occupied {
            generation: id.generation,
            value,
        };
        if reused.is_some() {
            self.free.pop();
            self.entries[id.index as usize] = entry;
        } else {
            self.entries.push(entry);
        }
        self.len += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: WrapperId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: WrapperId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, id: WrapperId) -> Option<T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let old = std::mem::replace(&mut self.entries[id.index as usize], Entry::Vacant);
        self.free.push(WrapperId {
            index: id.index,
            generation: id.generation.wrapping_add(1),
        });
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn ids(&self) -> Vec<WrapperId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, .. } => Some(WrapperId {
                    index: index as u32,
                    generation: *generation,
                }),
                Entry::Vacant => None,
            })
            .collect()
    }
}
