use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use super::sorted_map::{Comparator, SortedMap, SortedMapIter};

/// Immutable ordered set; two elements are the same member when the
/// comparator reports them equal.
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Ord + Clone + 'static> Default for SortedSet<T> {
    fn default() -> Self {
        Self {
            map: SortedMap::with_ord(),
        }
    }
}

impl<T: Ord + Clone + 'static> SortedSet<T> {
    pub fn from_iter_ord<I: IntoIterator<Item = T>>(items: I) -> Self {
        items.into_iter().fold(Self::default(), |set, item| set.insert(item))
    }
}

impl<T: Clone> SortedSet<T> {
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            map: SortedMap::new(comparator),
        }
    }

    pub fn comparator(&self) -> &Comparator<T> {
        self.map.comparator()
    }

    pub fn insert(&self, item: T) -> Self {
        Self {
            map: self.map.insert(item, ()),
        }
    }

    pub fn remove(&self, item: &T) -> Self {
        Self {
            map: self.map.remove(item),
        }
    }

    pub fn has(&self, item: &T) -> bool {
        self.map.contains_key(item)
    }

    pub fn first(&self) -> Option<&T> {
        self.map.min_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.map.max_key()
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.map.index_of(item)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.iter(),
        }
    }

    pub fn iter_from(&self, item: &T) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.iter_from(item),
        }
    }

    pub fn reverse_iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.reverse_iter(),
        }
    }

    /// Members of both sets; the larger set is used as the base.
    pub fn union(&self, other: &Self) -> Self {
        let (base, extra) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        extra.iter().fold(base.clone(), |set, item| set.insert(item.clone()))
    }

    /// Element-wise equality under the comparator.
    pub fn same_members(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let comparator = Arc::clone(self.comparator());
        self.iter()
            .zip(other.iter())
            .all(|(left, right)| comparator(left, right).is_eq())
    }
}

impl<T: Clone> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_members(other)
    }
}

impl<T: Debug + Clone> Debug for SortedSet<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, T: Clone> IntoIterator for &'a SortedSet<T> {
    type Item = &'a T;
    type IntoIter = SortedSetIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SortedSetIter<'a, T> {
    inner: SortedMapIter<'a, T, ()>,
}

impl<'a, T> Iterator for SortedSetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(item, _)| item)
    }
}
