//! The 16-byte key layout `spec.md` §4.3 describes:
//! `[type|dir_id:48 | type|part_id:15 | hash:64]`.
//!
//! `giga-store` only knows keys as opaque, totally-ordered 16-byte
//! arrays; the bit layout (which field means what, and which top bits
//! are "special"/"system" markers) is owned here so a prefix scan over
//! `(dir_id, partition)` enumerates exactly one partition's dentries in
//! hash order (invariant P5).

use giga_store::Key;

/// `dir_id` used for the cluster-wide special keys (currently only the
/// inode counter).
pub const SPECIAL_DIR_ID: i64 = -1;

/// `partition_index` used for a directory's own system records (the DI
/// mapping lives here; any future per-directory system record would too).
pub const SYSTEM_PARTITION: i16 = -1;

/// The fixed hash slot the inode counter and a directory's DI mapping are
/// stored under: these aren't name-keyed, so there is no hash to carry.
const ZERO_HASH: u64 = 0;

/// Builds the 16-byte key for a normal dentry: `dir_id` truncated to 48
/// bits (big-endian, so `dir_id = -1` naturally carries the special-key
/// top bit per two's-complement), `part_id` truncated to 16 bits (top bit
/// marks a system partition the same way), then the 8-byte name hash.
pub fn dentry_key(dir_id: i64, part_id: i16, hash: u64) -> Key {
    let mut key = [0u8; 16];
    let dir_bytes = dir_id.to_be_bytes();
    key[0..6].copy_from_slice(&dir_bytes[2..8]);
    key[6..8].copy_from_slice(&part_id.to_be_bytes());
    key[8..16].copy_from_slice(&hash.to_be_bytes());
    key
}

/// Key for the special cluster-wide inode counter record.
pub fn inode_counter_key() -> Key {
    dentry_key(SPECIAL_DIR_ID, SYSTEM_PARTITION, ZERO_HASH)
}

/// Key for a directory's serialised `DirectoryIndex` mapping.
pub fn mapping_key(dir_id: i64) -> Key {
    dentry_key(dir_id, SYSTEM_PARTITION, ZERO_HASH)
}

/// Inclusive `[start, end]` key range that covers every dentry in one
/// `(dir_id, part_id)` partition, in ascending hash order.
pub fn partition_range(dir_id: i64, part_id: i16) -> (Key, Key) {
    (
        dentry_key(dir_id, part_id, u64::MIN),
        dentry_key(dir_id, part_id, u64::MAX),
    )
}

/// Recovers `(dir_id, part_id, hash)` from a key produced by
/// `dentry_key`, sign-extending the truncated `dir_id` field back to
/// `i64`.
pub fn decode_key(key: &Key) -> (i64, i16, u64) {
    let mut dir_bytes = [0u8; 8];
    let top_bit_set = key[0] & 0x80 != 0;
    if top_bit_set {
        dir_bytes[0..2].fill(0xFF);
    }
    dir_bytes[2..8].copy_from_slice(&key[0..6]);
    let dir_id = i64::from_be_bytes(dir_bytes);
    let part_id = i16::from_be_bytes([key[6], key[7]]);
    let hash = u64::from_be_bytes(key[8..16].try_into().unwrap());
    (dir_id, part_id, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_normal_key() {
        let key = dentry_key(42, 3, 0xDEAD_BEEF_0000_0001);
        assert_eq!(decode_key(&key), (42, 3, 0xDEAD_BEEF_0000_0001));
    }

    #[test]
    fn special_dir_id_sign_extends() {
        let key = inode_counter_key();
        assert_eq!(decode_key(&key), (SPECIAL_DIR_ID, SYSTEM_PARTITION, 0));
    }

    #[test]
    fn partition_range_brackets_all_hashes() {
        let (start, end) = partition_range(7, 2);
        let mid = dentry_key(7, 2, 12345);
        assert!(start <= mid && mid <= end);
        assert!(end > dentry_key(7, 2, u64::MAX - 1));
    }

    #[test]
    fn keys_sort_by_dir_then_partition_then_hash() {
        let a = dentry_key(1, 0, 5);
        let b = dentry_key(1, 0, 6);
        let c = dentry_key(1, 1, 0);
        let d = dentry_key(2, 0, 0);
        assert!(a < b && b < c && c < d);
    }
}
