//! Order-preserving key encoding for the durable tables.
//!
//! A key is a table name followed by typed components. Strings and path
//! segments escape `0x00` as `0x00 0xFF` and end with `0x00 0x01`, so a
//! shorter string sorts before any extension of it. Complete paths end with
//! `0x00 0x02`; a path prefix omits that marker and therefore covers all
//! descendants. Numbers are 8 big-endian bytes with the sign bit flipped.

use crate::model::ResourcePath;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const SEPARATOR: u8 = 0x01;
const PATH_END: u8 = 0x02;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyBuilder {
    bytes: Vec<u8>,
}

impl KeyBuilder {
    pub fn new(table: &str) -> Self {
        Self::default().string(table)
    }

    pub fn string(mut self, value: &str) -> Self {
        self.write_escaped(value.as_bytes());
        self
    }

    pub fn number(mut self, value: i64) -> Self {
        let flipped = (value as u64) ^ (1 << 63);
        self.bytes.extend_from_slice(&flipped.to_be_bytes());
        self
    }

    pub fn path(mut self, path: &ResourcePath) -> Self {
        for segment in path.segments() {
            self.write_escaped(segment.as_bytes());
        }
        self.bytes.extend_from_slice(&[ESCAPE, PATH_END]);
        self
    }

    /// Encodes `path` without the end marker, for descendant scans.
    pub fn path_prefix(mut self, path: &ResourcePath) -> Self {
        for segment in path.segments() {
            self.write_escaped(segment.as_bytes());
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    fn write_escaped(&mut self, raw: &[u8]) {
        for &byte in raw {
            if byte == ESCAPE {
                self.bytes.extend_from_slice(&[ESCAPE, ESCAPED_NUL]);
            } else {
                self.bytes.push(byte);
            }
        }
        self.bytes.extend_from_slice(&[ESCAPE, SEPARATOR]);
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // Only reachable for all-0xFF prefixes, which no table produces.
    vec![u8::MAX; prefix.len() + 1]
}

/// Bounds covering every key of `table`.
pub fn table_range(table: &str) -> (Vec<u8>, Vec<u8>) {
    let start = KeyBuilder::new(table).build();
    let end = prefix_end(&start);
    (start, end)
}

/// Bounds covering every key that starts with `prefix`.
pub fn prefix_range(prefix: KeyBuilder) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.build();
    let end = prefix_end(&start);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> ResourcePath {
        ResourcePath::from_string(value).unwrap()
    }

    fn path_key(value: &str) -> Vec<u8> {
        KeyBuilder::new("docs").path(&path(value)).build()
    }

    #[test]
    fn paths_sort_segment_wise() {
        let mut keys = vec![
            path_key("a/b/c/d"),
            path_key("a/b"),
            path_key("ab/c"),
            path_key("a/ba"),
            path_key("a/b/c"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                path_key("a/b"),
                path_key("a/b/c"),
                path_key("a/b/c/d"),
                path_key("a/ba"),
                path_key("ab/c"),
            ]
        );
    }

    #[test]
    fn nul_bytes_keep_their_order() {
        let plain = KeyBuilder::new("t").string("a").build();
        let with_nul = KeyBuilder::new("t").string("a\0").build();
        let longer = KeyBuilder::new("t").string("a\u{1}").build();
        assert!(plain < with_nul);
        assert!(with_nul < longer);
    }

    #[test]
    fn numbers_sort_across_signs() {
        let key = |value: i64| KeyBuilder::new("n").number(value).build();
        assert!(key(-5) < key(-1));
        assert!(key(-1) < key(0));
        assert!(key(0) < key(7));
        assert!(key(7) < key(i64::MAX));
    }

    #[test]
    fn prefix_ranges_cover_descendants_only() {
        let (start, end) = prefix_range(KeyBuilder::new("docs").path_prefix(&path("rooms")));
        let child = path_key("rooms/eros");
        let grandchild = path_key("rooms/eros/messages/1");
        let sibling = path_key("roomsx/a");
        assert!(start <= child && child < end);
        assert!(start <= grandchild && grandchild < end);
        assert!(!(start <= sibling && sibling < end));

        let (table_start, table_end) = table_range("docs");
        assert!(table_start <= sibling && sibling < table_end);
        assert!(KeyBuilder::new("docsx").build() >= table_end);
    }
}
