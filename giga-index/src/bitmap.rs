use crate::hash::{hash_name, hash_prefix};
use thiserror::Error;

/// Magic value stamped into every serialised directory index, so a stray
/// byte range is never mistaken for a bitmap.
const DI_MAGIC: u32 = 0x4749_4742; // "GIGB"

/// Largest radix this workspace supports. The spec allows 8 or 14; 14 is
/// chosen here (see DESIGN.md) since it comfortably covers clusters with
/// thousands of virtual partitions while the index still fits a `u16`.
pub const MAX_RADIX: u8 = 14;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("directory index buffer too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("bad directory index magic: {0:#x}")]
    BadMagic(u32),
    #[error("radix {0} exceeds MAX_RADIX ({MAX_RADIX})")]
    RadixTooLarge(u8),
}

/// A growing bitmap that maps a directory's children to partitions, and
/// partitions to servers. One instance per directory, per spec §3/§4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryIndex {
    dir_id: i64,
    zeroth_server: i16,
    radix: u8,
    /// Bit `i` set means partition `i` has been created for this directory.
    bitmap: Vec<u8>,
}

fn bytes_for_radix(radix: u8) -> usize {
    // radix bits address partitions 0..2^radix; partition 0 is implicit
    // and always present, but we still size the bitmap to cover the full
    // 2^radix space so SetBit never needs to resize mid-update.
    if radix == 0 {
        1
    } else {
        (1usize << radix).div_ceil(8)
    }
}

/// Smallest `r` such that `i < 2^r`, i.e. the radix at which partition `i`
/// first comes into existence. Partition 0 is the implicit root (radix 0).
fn partition_radix(i: u16) -> u8 {
    if i == 0 {
        0
    } else {
        16 - (i.leading_zeros() as u8)
    }
}

fn parent_index(i: u16) -> u16 {
    debug_assert!(i > 0);
    let r = partition_radix(i);
    let top_bit = 1u16 << (r - 1);
    i - top_bit
}

impl DirectoryIndex {
    /// A brand new index for `dir_id`, owned at partition 0 by
    /// `zeroth_server`, with only bit 0 set.
    pub fn new(dir_id: i64, zeroth_server: i16) -> Self {
        let mut di = DirectoryIndex {
            dir_id,
            zeroth_server,
            radix: 0,
            bitmap: vec![0u8; bytes_for_radix(0)],
        };
        di.set_bit_unchecked(0);
        di
    }

    pub fn dir_id(&self) -> i64 {
        self.dir_id
    }

    pub fn zeroth_server(&self) -> i16 {
        self.zeroth_server
    }

    pub fn radix(&self) -> u8 {
        self.radix
    }

    fn set_bit_unchecked(&mut self, i: u16) {
        let byte = (i as usize) / 8;
        if byte >= self.bitmap.len() {
            self.bitmap.resize(byte + 1, 0);
        }
        self.bitmap[byte] |= 1 << (i % 8);
    }

    pub fn bit_is_set(&self, i: u16) -> bool {
        let byte = (i as usize) / 8;
        match self.bitmap.get(byte) {
            Some(b) => (b & (1 << (i % 8))) != 0,
            None => false,
        }
    }

    /// Marks partition `i` as present and grows the radix monotonically so
    /// `radix == ceil(log2(highest_set_bit + 1))`.
    pub fn set_bit(&mut self, i: u16) {
        self.set_bit_unchecked(i);
        let needed = partition_radix(i).max(self.radix);
        if needed > self.radix {
            self.radix = needed;
        }
    }

    /// Partition holding `name`, found by descending routing rule F from
    /// the hash prefix at the current radix down to the lowest present
    /// ancestor. Bit 0 is always set, so this always terminates.
    pub fn get_index(&self, name: &str) -> u16 {
        let h = hash_name(name);
        let mut idx = hash_prefix(self.radix, h);
        while idx != 0 && !self.bit_is_set(idx) {
            idx = parent_index(idx);
        }
        idx
    }

    /// Server owning partition `i`. The zeroth server is fixed at
    /// directory creation and never changes (spec §3).
    pub fn server_for_index(&self, i: u16, n_servers: i64) -> i16 {
        (((i as i64) + self.zeroth_server as i64).rem_euclid(n_servers)) as i16
    }

    /// True if partition `i` exists, its split child does not yet exist,
    /// and the child index stays within the deepest legal radix and the
    /// cluster's virtual-server ceiling.
    pub fn is_splittable(&self, i: u16, max_virtual_servers: u32) -> bool {
        if !self.bit_is_set(i) {
            return false;
        }
        let child = self.new_index_for_splitting(i);
        if child as u32 >= max_virtual_servers {
            return false;
        }
        if partition_radix(child) > MAX_RADIX {
            return false;
        }
        !self.bit_is_set(child)
    }

    /// The partition index a split of `i` would create.
    pub fn new_index_for_splitting(&self, i: u16) -> u16 {
        let r = partition_radix(i);
        i + (1u16 << r)
    }

    /// True iff `name` belongs to child partition `c` rather than its
    /// parent, i.e. the migration predicate used by `BulkExtractor`.
    pub fn belongs_to_child(name: &str, c: u16) -> bool {
        let h = hash_name(name);
        hash_prefix(partition_radix(c), h) == c
    }

    /// Merges another directory index of the same directory into this
    /// one: radix becomes the max of the two, bitmap becomes the
    /// bitwise OR. Idempotent and monotonic (P1).
    pub fn update(&mut self, other: &DirectoryIndex) {
        debug_assert_eq!(self.dir_id, other.dir_id);
        if other.radix > self.radix {
            self.radix = other.radix;
        }
        let needed_bytes = bytes_for_radix(self.radix).max(self.bitmap.len());
        if self.bitmap.len() < needed_bytes {
            self.bitmap.resize(needed_bytes, 0);
        }
        for (i, b) in other.bitmap.iter().enumerate() {
            if i >= self.bitmap.len() {
                self.bitmap.push(*b);
            } else {
                self.bitmap[i] |= *b;
            }
        }
    }

    /// All partition indices currently present, in ascending order.
    pub fn present_partitions(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for (byte_idx, byte) in self.bitmap.iter().enumerate() {
            for bit in 0..8u16 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx as u16) * 8 + bit);
                }
            }
        }
        out
    }

    /// Self-describing serialised form: header then bitmap bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 2 + 1 + 2 + 4 + self.bitmap.len());
        out.extend_from_slice(&self.dir_id.to_le_bytes());
        out.extend_from_slice(&self.zeroth_server.to_le_bytes());
        out.push(self.radix);
        out.extend_from_slice(&(self.bitmap.len() as u16).to_le_bytes());
        out.extend_from_slice(&DI_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.bitmap);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        const HEADER_LEN: usize = 8 + 2 + 1 + 2 + 4;
        if bytes.len() < HEADER_LEN {
            return Err(IndexError::TooShort {
                need: HEADER_LEN,
                got: bytes.len(),
            });
        }
        let dir_id = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let zeroth_server = i16::from_le_bytes(bytes[8..10].try_into().unwrap());
        let radix = bytes[10];
        if radix > MAX_RADIX {
            return Err(IndexError::RadixTooLarge(radix));
        }
        let bitmap_len = u16::from_le_bytes(bytes[11..13].try_into().unwrap()) as usize;
        let magic = u32::from_le_bytes(bytes[13..17].try_into().unwrap());
        if magic != DI_MAGIC {
            return Err(IndexError::BadMagic(magic));
        }
        if bytes.len() < HEADER_LEN + bitmap_len {
            return Err(IndexError::TooShort {
                need: HEADER_LEN + bitmap_len,
                got: bytes.len(),
            });
        }
        let bitmap = bytes[HEADER_LEN..HEADER_LEN + bitmap_len].to_vec();
        Ok(DirectoryIndex {
            dir_id,
            zeroth_server,
            radix,
            bitmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_index_has_bit_zero_set() {
        let di = DirectoryIndex::new(42, 3);
        assert!(di.bit_is_set(0));
        assert_eq!(di.radix(), 0);
    }

    #[test]
    fn set_bit_grows_radix_monotonically() {
        let mut di = DirectoryIndex::new(1, 0);
        di.set_bit(5); // 5 needs 3 bits (0b101)
        assert_eq!(di.radix(), 3);
        di.set_bit(1); // would need only 1 bit, radix must not shrink
        assert_eq!(di.radix(), 3);
    }

    #[test]
    fn round_trip_encode_decode() {
        let mut di = DirectoryIndex::new(7, 2);
        di.set_bit(1);
        di.set_bit(3);
        let bytes = di.encode();
        let back = DirectoryIndex::decode(&bytes).unwrap();
        assert_eq!(di, back);
    }

    #[test]
    fn update_is_idempotent() {
        let mut a = DirectoryIndex::new(1, 0);
        a.set_bit(1);
        let mut b = DirectoryIndex::new(1, 0);
        b.set_bit(1);
        b.set_bit(3);

        let mut once = a.clone();
        once.update(&b);
        let mut twice = once.clone();
        twice.update(&b);
        assert_eq!(once, twice); // P1
    }

    #[test]
    fn get_index_descends_to_lowest_present_ancestor() {
        let di = DirectoryIndex::new(1, 0);
        // Only bit 0 exists; every name must route there regardless of hash.
        assert_eq!(di.get_index("anything"), 0);
        assert_eq!(di.get_index("something-else"), 0);
    }

    #[test]
    fn splittable_respects_virtual_server_ceiling() {
        let mut di = DirectoryIndex::new(1, 0);
        assert!(di.is_splittable(0, 1024));
        assert!(!di.is_splittable(0, 1)); // child index 1 >= ceiling of 1
        di.set_bit(1);
        assert!(!di.is_splittable(0, 1024)); // child already present
    }

    #[test]
    fn max_radix_exhaustion_blocks_further_splits() {
        let mut di = DirectoryIndex::new(1, 0);
        let deepest = 1u16 << MAX_RADIX;
        di.set_bit(deepest - 1);
        // splitting the deepest legal partition would need MAX_RADIX + 1 bits
        assert!(!di.is_splittable(deepest - 1, u32::MAX));
    }
}
