use std::hash::Hash;

use hashbrown::{Equivalent, HashMap};

use crate::Error;

/// A map from a structural key to a lazily created GPU object.
#[derive(Debug)]
pub(crate) struct ObjectCache<K, V> {
    name: &'static str,
    entries: HashMap<K, V>,
}

impl<K, V> ObjectCache<K, V>
where
    K: Hash + Eq,
    V: Copy,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.entries.get(key).copied()
    }

    /// Returns the object for `key`, creating it with `create` on a miss.
    ///
    /// If the entry cannot be inserted the new object is passed to `destroy`
    /// and [`Error::CacheInsert`] is returned.
    pub fn get_or_create<Q, C, D>(&mut self, key: &Q, create: C, destroy: D) -> Result<V, Error>
    where
        Q: ?Sized + Hash + Equivalent<K> + ToOwned<Owned = K>,
        C: FnOnce(&Q) -> Result<V, Error>,
        D: FnOnce(V),
    {
        if let Some(value) = self.entries.get(key) {
            return Ok(*value);
        }

        let value = create(key)?;

        if self.entries.try_reserve(1).is_err() {
            tracing::error!("failed to insert {} into cache", self.name);
            destroy(value);
            return Err(Error::CacheInsert(self.name));
        }

        self.entries.insert(key.to_owned(), value);
        Ok(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes all entries, passing each object to `destroy`.
    pub fn clear(&mut self, mut destroy: impl FnMut(V)) {
        for (_, value) in self.entries.drain() {
            destroy(value);
        }
    }
}
