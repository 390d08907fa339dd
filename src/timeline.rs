use std::collections::HashMap;

use crate::model::{Action, Cursor, Item};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merged {
    Inserted,
    Updated,
}

/// Ordered, de-duplicated item collection. Oldest first.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    items: Vec<Item>,
    index: HashMap<String, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.index.get(id).map(|&idx| &self.items[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Newest item by ordering key, not by position.
    pub fn newest(&self) -> Option<&Item> {
        self.items.iter().max_by_key(|item| item.key)
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.newest().map(Item::cursor)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    /// Merge a single streamed item. Known ids are refreshed where they sit.
    pub fn merge_one(&mut self, item: Item) -> Merged {
        if let Some(&idx) = self.index.get(&item.id) {
            self.items[idx].refresh_from(&item);
            return Merged::Updated;
        }
        self.index.insert(item.id.clone(), self.items.len());
        self.items.push(item);
        Merged::Inserted
    }

    /// Merge a fetched batch. Whatever order the source returned, the new
    /// items land after the existing ones in ascending key order. Returns the
    /// number of items inserted.
    pub fn merge_batch(&mut self, mut batch: Vec<Item>) -> usize {
        batch.sort_by_key(|item| item.key);
        let mut inserted = 0;
        for item in batch {
            if self.merge_one(item) == Merged::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    /// Resolve the item an engagement action targets: the reposted original
    /// when `id` names a repost wrapper.
    pub fn action_target(&self, id: &str) -> Option<&Item> {
        self.get(id).map(Item::target)
    }

    /// Apply an already-confirmed action to exactly one item. Never inserts
    /// or reorders. Returns false when `id` is unknown.
    pub fn apply(&mut self, action: Action, id: &str) -> bool {
        let Some(&idx) = self.index.get(id) else {
            return false;
        };
        let item = &mut self.items[idx];
        if let Some(original) = item.reposted.as_mut() {
            action.apply_to(original);
        } else {
            action.apply_to(item);
        }
        true
    }
}
