//! The value half of the MetaDB schema: a 64-byte `FileStat` header
//! followed by three varint-length-prefixed byte records (name, external
//! path, embedded data), per `spec.md` §3/§4.3.

use crate::error::MetaError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Type discriminator bit in `mode`, set for directories. Permission bits
/// live in the low 12 bits, matching familiar POSIX `st_mode` texture
/// without pulling in `libc` for a handful of constants this crate
/// doesn't otherwise need.
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
const S_IFMT: u32 = 0o170_000;

/// Status-flags bit: the value's `data` record holds the file's entire
/// content inline rather than a pointer into external storage.
pub const STATUS_EMBEDDED_DATA: u8 = 1 << 0;

const FILESTAT_LEN: usize = 64;

/// One dentry: the semantic fields of `spec.md` §3 plus the three
/// variable-length records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    /// `-1` for files that inherit their identity from the partition.
    pub inode: i64,
    /// `-1` for directories.
    pub size: i64,
    pub mode: u32,
    pub status_flags: u8,
    /// Only meaningful for directories: the server owning partition 0.
    pub zeroth_server: i16,
    pub uid: i32,
    pub gid: i32,
    pub ctime: i64,
    pub mtime: i64,
    pub name: String,
    pub path: String,
    pub data: Vec<u8>,
}

impl Dentry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Default value installed by `MetaDB::new_file`.
    pub fn new_file(name: &str, mode: u32, uid: i32, gid: i32, now: i64) -> Self {
        Dentry {
            inode: -1,
            size: 0,
            mode: (mode & 0o7777) | S_IFREG,
            status_flags: 0,
            zeroth_server: -1,
            uid,
            gid,
            ctime: now,
            mtime: now,
            name: name.to_string(),
            path: String::new(),
            data: Vec::new(),
        }
    }

    /// Default value installed by `MetaDB::new_directory`.
    pub fn new_directory(
        name: &str,
        mode: u32,
        uid: i32,
        gid: i32,
        now: i64,
        inode: i64,
        zeroth_server: i16,
    ) -> Self {
        Dentry {
            inode,
            size: -1,
            mode: (mode & 0o7777) | S_IFDIR,
            status_flags: 0,
            zeroth_server,
            uid,
            gid,
            ctime: now,
            mtime: now,
            name: name.to_string(),
            path: String::new(),
            data: Vec::new(),
        }
    }

    /// Overwrites only the permission bits of `mode`, preserving the
    /// file/dir type discriminator (spec §4.3 `SetFileMode`).
    pub fn set_mode_bits(&mut self, perm: u32) {
        self.mode = (self.mode & S_IFMT) | (perm & 0o7777);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(FILESTAT_LEN);
        header.write_i64::<LittleEndian>(self.inode).unwrap();
        header.write_i64::<LittleEndian>(self.size).unwrap();
        header.write_u32::<LittleEndian>(self.mode).unwrap();
        header.write_u8(self.status_flags).unwrap();
        header.extend_from_slice(&[0u8; 3]); // alignment padding
        header.write_i16::<LittleEndian>(self.zeroth_server).unwrap();
        header.extend_from_slice(&[0u8; 2]); // alignment padding
        header.write_i32::<LittleEndian>(self.uid).unwrap();
        header.write_i32::<LittleEndian>(self.gid).unwrap();
        header.write_i64::<LittleEndian>(self.ctime).unwrap();
        header.write_i64::<LittleEndian>(self.mtime).unwrap();
        header.resize(FILESTAT_LEN, 0); // reserved tail, room to grow

        let mut out = header;
        write_varint_field(&mut out, self.name.as_bytes());
        write_varint_field(&mut out, self.path.as_bytes());
        write_varint_field(&mut out, &self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        if bytes.len() < FILESTAT_LEN {
            return Err(MetaError::Corrupt(format!(
                "dentry value too short: {} < {}",
                bytes.len(),
                FILESTAT_LEN
            )));
        }
        let mut header = Cursor::new(&bytes[0..FILESTAT_LEN]);
        let inode = header.read_i64::<LittleEndian>().unwrap();
        let size = header.read_i64::<LittleEndian>().unwrap();
        let mode = header.read_u32::<LittleEndian>().unwrap();
        let status_flags = header.read_u8().unwrap();
        header.set_position(header.position() + 3);
        let zeroth_server = header.read_i16::<LittleEndian>().unwrap();
        header.set_position(header.position() + 2);
        let uid = header.read_i32::<LittleEndian>().unwrap();
        let gid = header.read_i32::<LittleEndian>().unwrap();
        let ctime = header.read_i64::<LittleEndian>().unwrap();
        let mtime = header.read_i64::<LittleEndian>().unwrap();

        let mut rest = &bytes[FILESTAT_LEN..];
        let name = read_varint_field(&mut rest)?;
        let path = read_varint_field(&mut rest)?;
        let data = read_varint_field(&mut rest)?;

        Ok(Dentry {
            inode,
            size,
            mode,
            status_flags,
            zeroth_server,
            uid,
            gid,
            ctime,
            mtime,
            name: String::from_utf8(name)
                .map_err(|e| MetaError::Corrupt(format!("non-utf8 name: {e}")))?,
            path: String::from_utf8(path)
                .map_err(|e| MetaError::Corrupt(format!("non-utf8 path: {e}")))?,
            data,
        })
    }
}

fn write_varint_field(out: &mut Vec<u8>, bytes: &[u8]) {
    write_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn read_varint_field(rest: &mut &[u8]) -> Result<Vec<u8>, MetaError> {
    let len = read_uvarint(rest)? as usize;
    if rest.len() < len {
        return Err(MetaError::Corrupt(format!(
            "varint field claims {len} bytes but only {} remain",
            rest.len()
        )));
    }
    let (field, remainder) = rest.split_at(len);
    *rest = remainder;
    Ok(field.to_vec())
}

/// Unsigned LEB128, per `spec.md` §3's "three varint-length records".
fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_uvarint(rest: &mut &[u8]) -> Result<u64, MetaError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, remainder) = rest
            .split_first()
            .ok_or_else(|| MetaError::Corrupt("truncated varint".to_string()))?;
        *rest = remainder;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(MetaError::Corrupt("varint too long".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_file_dentry() {
        let d = Dentry::new_file("readme.txt", 0o644, 10, 10, 1_700_000_000);
        let back = Dentry::decode(&d.encode()).unwrap();
        assert_eq!(d, back); // R1
        assert!(!back.is_dir());
        assert_eq!(back.mode & 0o777, 0o644);
    }

    #[test]
    fn round_trip_directory_dentry_with_embedded_data() {
        let mut d = Dentry::new_directory("sub", 0o755, 0, 0, 42, 99, 2);
        d.data = vec![1, 2, 3, 4, 5];
        d.status_flags |= STATUS_EMBEDDED_DATA;
        let back = Dentry::decode(&d.encode()).unwrap();
        assert_eq!(d, back);
        assert!(back.is_dir());
        assert_eq!(back.zeroth_server, 2);
    }

    #[test]
    fn set_mode_bits_preserves_type() {
        let mut d = Dentry::new_directory("d", 0o755, 0, 0, 0, 1, 0);
        d.set_mode_bits(0o700);
        assert!(d.is_dir());
        assert_eq!(d.mode & 0o7777, 0o700);
    }

    #[test]
    fn long_name_round_trips_through_varint() {
        let long_name = "x".repeat(500);
        let d = Dentry::new_file(&long_name, 0o644, 0, 0, 0);
        let back = Dentry::decode(&d.encode()).unwrap();
        assert_eq!(back.name, long_name);
    }
}
