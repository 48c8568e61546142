use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::util::assert::fail;

pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

impl Color {
    fn flip(self) -> Self {
        match self {
            Color::Red => Color::Black,
            Color::Black => Color::Red,
        }
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
    size: usize,
}

/// Immutable ordered map backed by a left-leaning red-black tree.
///
/// Every update returns a new map that shares all untouched subtrees with
/// the receiver, so clones are O(1) and old versions stay valid.
pub struct SortedMap<K, V> {
    comparator: Comparator<K>,
    root: Link<K, V>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            comparator: Arc::clone(&self.comparator),
            root: self.root.clone(),
        }
    }
}

impl<K: Ord + Clone + 'static, V: Clone> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::with_ord()
    }
}

impl<K: Ord + Clone + 'static, V: Clone> SortedMap<K, V> {
    pub fn with_ord() -> Self {
        Self::new(Arc::new(|left: &K, right: &K| left.cmp(right)))
    }
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    pub fn new(comparator: Comparator<K>) -> Self {
        Self {
            comparator,
            root: None,
        }
    }

    pub fn comparator(&self) -> &Comparator<K> {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = &self.root;
        while let Some(current) = node {
            match (self.comparator)(key, &current.key) {
                Ordering::Equal => return Some(&current.value),
                Ordering::Less => node = &current.left,
                Ordering::Greater => node = &current.right,
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Position of `key` in iteration order.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut pruned = 0;
        let mut node = &self.root;
        while let Some(current) = node {
            match (self.comparator)(key, &current.key) {
                Ordering::Equal => return Some(pruned + size(&current.left)),
                Ordering::Less => node = &current.left,
                Ordering::Greater => {
                    pruned += size(&current.left) + 1;
                    node = &current.right;
                }
            }
        }
        None
    }

    pub fn insert(&self, key: K, value: V) -> Self {
        let mut root = insert_node(&self.root, key, value, &self.comparator);
        root.color = Color::Black;
        Self {
            comparator: Arc::clone(&self.comparator),
            root: Some(Arc::new(root)),
        }
    }

    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = match &self.root {
            Some(root) => remove_node(owned(root), key, &self.comparator),
            None => None,
        };
        Self {
            comparator: Arc::clone(&self.comparator),
            root: root.map(|mut node| {
                node.color = Color::Black;
                Arc::new(node)
            }),
        }
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        while let Some(left) = &node.left {
            node = left;
        }
        Some((&node.key, &node.value))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        while let Some(right) = &node.right {
            node = right;
        }
        Some((&node.key, &node.value))
    }

    pub fn min_key(&self) -> Option<&K> {
        self.first().map(|(key, _)| key)
    }

    pub fn max_key(&self) -> Option<&K> {
        self.last().map(|(key, _)| key)
    }

    pub fn iter(&self) -> SortedMapIter<'_, K, V> {
        let mut iter = SortedMapIter {
            stack: Vec::new(),
            reverse: false,
        };
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            iter.stack.push(current);
            node = current.left.as_deref();
        }
        iter
    }

    /// Iterates entries whose key is `>= key`.
    pub fn iter_from(&self, key: &K) -> SortedMapIter<'_, K, V> {
        let mut iter = SortedMapIter {
            stack: Vec::new(),
            reverse: false,
        };
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            match (self.comparator)(key, &current.key) {
                Ordering::Equal => {
                    iter.stack.push(current);
                    break;
                }
                Ordering::Less => {
                    iter.stack.push(current);
                    node = current.left.as_deref();
                }
                Ordering::Greater => node = current.right.as_deref(),
            }
        }
        iter
    }

    pub fn reverse_iter(&self) -> SortedMapIter<'_, K, V> {
        let mut iter = SortedMapIter {
            stack: Vec::new(),
            reverse: true,
        };
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            iter.stack.push(current);
            node = current.right.as_deref();
        }
        iter
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Audits the red-black invariants and returns the black height.
    pub fn check_invariants(&self) -> Result<usize, String> {
        if is_red(&self.root) {
            return Err("root must be black".into());
        }
        let height = check_node(&self.root, &self.comparator, None, None)?;
        let bound = 1usize.checked_shl(height as u32).unwrap_or(usize::MAX);
        if bound > self.len() + 1 {
            return Err(format!(
                "black height {height} too large for {} entries",
                self.len()
            ));
        }
        Ok(height)
    }
}

/// Maps are equal when they hold the same entries in the same order. Keys
/// are compared with the receiver's comparator.
impl<K: Clone, V: Clone + PartialEq> PartialEq for SortedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|((left_key, left), (right_key, right))| {
                (self.comparator)(left_key, right_key).is_eq() && left == right
            })
    }
}

impl<K: Debug + Clone, V: Debug + Clone> Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct SortedMapIter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    reverse: bool,
}

impl<'a, K, V> Iterator for SortedMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut next = if self.reverse {
            node.left.as_deref()
        } else {
            node.right.as_deref()
        };
        while let Some(current) = next {
            self.stack.push(current);
            next = if self.reverse {
                current.right.as_deref()
            } else {
                current.left.as_deref()
            };
        }
        Some((&node.key, &node.value))
    }
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().map_or(false, |node| node.color == Color::Red)
}

fn left_left_is_red<K, V>(node: &Node<K, V>) -> bool {
    node.left.as_ref().map_or(false, |left| is_red(&left.left))
}

fn right_left_is_red<K, V>(node: &Node<K, V>) -> bool {
    node.right.as_ref().map_or(false, |right| is_red(&right.left))
}

fn owned<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Node<K, V> {
    Node::clone(node)
}

fn take_child<K: Clone, V: Clone>(link: &mut Link<K, V>) -> Node<K, V> {
    match link.take() {
        Some(node) => Arc::try_unwrap(node).unwrap_or_else(|shared| Node::clone(&shared)),
        None => fail("LLRB rotation on a missing child"),
    }
}

impl<K, V> Node<K, V> {
    fn leaf(key: K, value: V) -> Self {
        Self {
            key,
            value,
            color: Color::Red,
            left: None,
            right: None,
            size: 1,
        }
    }

    fn update_size(&mut self) {
        self.size = 1 + size(&self.left) + size(&self.right);
    }
}

fn rotate_left<K: Clone, V: Clone>(mut node: Node<K, V>) -> Node<K, V> {
    let mut pivot = take_child(&mut node.right);
    node.right = pivot.left.take();
    pivot.color = node.color;
    node.color = Color::Red;
    node.update_size();
    pivot.left = Some(Arc::new(node));
    pivot.update_size();
    pivot
}

fn rotate_right<K: Clone, V: Clone>(mut node: Node<K, V>) -> Node<K, V> {
    let mut pivot = take_child(&mut node.left);
    node.left = pivot.right.take();
    pivot.color = node.color;
    node.color = Color::Red;
    node.update_size();
    pivot.right = Some(Arc::new(node));
    pivot.update_size();
    pivot
}

fn color_flip<K: Clone, V: Clone>(mut node: Node<K, V>) -> Node<K, V> {
    node.color = node.color.flip();
    node.left = node.left.take().map(|child| {
        let mut child = owned(&child);
        child.color = child.color.flip();
        Arc::new(child)
    });
    node.right = node.right.take().map(|child| {
        let mut child = owned(&child);
        child.color = child.color.flip();
        Arc::new(child)
    });
    node
}

fn fix_up<K: Clone, V: Clone>(mut node: Node<K, V>) -> Node<K, V> {
    if is_red(&node.right) && !is_red(&node.left) {
        node = rotate_left(node);
    }
    if is_red(&node.left) && left_left_is_red(&node) {
        node = rotate_right(node);
    }
    if is_red(&node.left) && is_red(&node.right) {
        node = color_flip(node);
    }
    node
}

fn insert_node<K: Clone, V: Clone>(
    link: &Link<K, V>,
    key: K,
    value: V,
    comparator: &Comparator<K>,
) -> Node<K, V> {
    let Some(existing) = link else {
        return Node::leaf(key, value);
    };
    let mut node = owned(existing);
    match comparator(&key, &node.key) {
        Ordering::Less => node.left = Some(Arc::new(insert_node(&node.left, key, value, comparator))),
        Ordering::Equal => {
            node.key = key;
            node.value = value;
        }
        Ordering::Greater => {
            node.right = Some(Arc::new(insert_node(&node.right, key, value, comparator)))
        }
    }
    node.update_size();
    fix_up(node)
}

fn move_red_left<K: Clone, V: Clone>(node: Node<K, V>) -> Node<K, V> {
    let mut node = color_flip(node);
    if right_left_is_red(&node) {
        let right = rotate_right(take_child(&mut node.right));
        node.right = Some(Arc::new(right));
        node.update_size();
        node = rotate_left(node);
        node = color_flip(node);
    }
    node
}

fn move_red_right<K: Clone, V: Clone>(node: Node<K, V>) -> Node<K, V> {
    let mut node = color_flip(node);
    if left_left_is_red(&node) {
        node = rotate_right(node);
        node = color_flip(node);
    }
    node
}

fn remove_min<K: Clone, V: Clone>(node: Node<K, V>) -> Option<Node<K, V>> {
    if node.left.is_none() {
        return None;
    }
    let mut node = node;
    if !is_red(&node.left) && !left_left_is_red(&node) {
        node = move_red_left(node);
    }
    node.left = node
        .left
        .take()
        .and_then(|left| remove_min(owned(&left)))
        .map(Arc::new);
    node.update_size();
    Some(fix_up(node))
}

fn min_entry<K: Clone, V: Clone>(node: &Node<K, V>) -> (K, V) {
    let mut current = node;
    while let Some(left) = &current.left {
        current = left;
    }
    (current.key.clone(), current.value.clone())
}

fn remove_node<K: Clone, V: Clone>(
    node: Node<K, V>,
    key: &K,
    comparator: &Comparator<K>,
) -> Option<Node<K, V>> {
    let mut node = node;
    if comparator(key, &node.key) == Ordering::Less {
        if node.left.is_some() && !is_red(&node.left) && !left_left_is_red(&node) {
            node = move_red_left(node);
        }
        node.left = node
            .left
            .take()
            .and_then(|left| remove_node(owned(&left), key, comparator))
            .map(Arc::new);
    } else {
        if is_red(&node.left) {
            node = rotate_right(node);
        }
        if node.right.is_some() && !is_red(&node.right) && !right_left_is_red(&node) {
            node = move_red_right(node);
        }
        if comparator(key, &node.key) == Ordering::Equal {
            let right = node.right.take()?;
            let right = owned(&right);
            let (min_key, min_value) = min_entry(&right);
            node.key = min_key;
            node.value = min_value;
            node.right = remove_min(right).map(Arc::new);
            node.update_size();
            return Some(fix_up(node));
        }
        node.right = node
            .right
            .take()
            .and_then(|right| remove_node(owned(&right), key, comparator))
            .map(Arc::new);
    }
    node.update_size();
    Some(fix_up(node))
}

fn check_node<K, V>(
    link: &Link<K, V>,
    comparator: &Comparator<K>,
    lower: Option<&K>,
    upper: Option<&K>,
) -> Result<usize, String> {
    let Some(node) = link else {
        return Ok(0);
    };
    if let Some(lower) = lower {
        if comparator(lower, &node.key) != Ordering::Less {
            return Err("keys out of order".into());
        }
    }
    if let Some(upper) = upper {
        if comparator(&node.key, upper) != Ordering::Less {
            return Err("keys out of order".into());
        }
    }
    if is_red(&node.right) {
        return Err("right child is red".into());
    }
    if node.color == Color::Red && is_red(&node.left) {
        return Err("two consecutive red nodes".into());
    }
    if node.size != 1 + size(&node.left) + size(&node.right) {
        return Err("size bookkeeping mismatch".into());
    }
    let left = check_node(&node.left, comparator, lower, Some(&node.key))?;
    let right = check_node(&node.right, comparator, Some(&node.key), upper)?;
    if left != right {
        return Err("black height mismatch".into());
    }
    Ok(left + usize::from(node.color == Color::Black))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn reverse_map() -> SortedMap<i32, i32> {
        SortedMap::new(Arc::new(|a: &i32, b: &i32| b.cmp(a)))
    }

    #[test]
    fn insert_get_and_order() {
        let map = SortedMap::with_ord().insert(3, "c").insert(1, "a").insert(2, "b");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2), Some(&"b"));
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(map.reverse_iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(map.index_of(&3), Some(2));
        assert_eq!(map.index_of(&9), None);
    }

    #[test]
    fn maps_with_the_same_entries_are_equal() {
        let left = SortedMap::with_ord().insert(1, "a").insert(2, "b");
        let right = SortedMap::with_ord().insert(2, "b").insert(1, "a");
        assert_eq!(left, right);
        assert_ne!(left, right.insert(2, "c"));
        assert_ne!(left, right.remove(&1));
    }

    #[test]
    fn updates_do_not_disturb_old_versions() {
        let first = SortedMap::with_ord().insert(1, 10).insert(2, 20);
        let second = first.insert(3, 30).remove(&1);
        let third = second.insert(2, 99);
        assert_eq!(first.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(second.get(&2), Some(&20));
        assert_eq!(third.get(&2), Some(&99));
    }

    #[test]
    fn custom_comparator_is_honoured() {
        let map = reverse_map().insert(1, 1).insert(5, 5).insert(3, 3);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![5, 3, 1]);
        assert_eq!(map.min_key(), Some(&5));
        assert_eq!(map.max_key(), Some(&1));
    }

    #[test]
    fn iter_from_starts_at_lower_bound() {
        let map = (0..10).fold(SortedMap::with_ord(), |map, i| map.insert(i * 2, ()));
        let from = map.iter_from(&5).map(|(k, _)| *k).collect::<Vec<_>>();
        assert_eq!(from, vec![6, 8, 10, 12, 14, 16, 18]);
        let exact = map.iter_from(&6).next().map(|(k, _)| *k);
        assert_eq!(exact, Some(6));
        assert_eq!(map.iter_from(&100).count(), 0);
    }

    #[test]
    fn random_operations_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(2024);
        let mut keys: Vec<i32> = (0..500).collect();
        keys.shuffle(&mut rng);

        let mut map = SortedMap::with_ord();
        let mut reference = std::collections::BTreeMap::new();
        for key in &keys {
            map = map.insert(*key, key * 10);
            reference.insert(*key, key * 10);
            map.check_invariants().unwrap();
        }
        keys.shuffle(&mut rng);
        for key in keys.iter().take(350) {
            map = map.remove(key);
            reference.remove(key);
            map.check_invariants().unwrap();
        }
        map = map.remove(&10_000);
        assert_eq!(map.len(), reference.len());
        let ours: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<_> = reference.into_iter().collect();
        assert_eq!(ours, expected);
    }

    #[test]
    fn removing_everything_leaves_empty_map() {
        let mut map = (0..64).fold(SortedMap::with_ord(), |map, i| map.insert(i, i));
        for i in (0..64).rev() {
            map = map.remove(&i);
            map.check_invariants().unwrap();
        }
        assert!(map.is_empty());
        assert_eq!(map.first(), None);
    }
}
