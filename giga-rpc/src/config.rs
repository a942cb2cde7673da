//! The key-value config file format from spec.md §6. One recognised
//! option per line: `key value` (or `key value value` for `old_data`'s
//! `(prefix, count)` pair). Unrecognised keys are ignored rather than
//! rejected, so a config file can carry options a future version adds.

use crate::error::RpcError;
use nom::{
    bytes::complete::take_while1,
    character::complete::space1,
    combinator::rest,
    sequence::preceded,
    IResult,
};
use std::path::Path;

pub const DEFAULT_DIR_SPLIT_THRESHOLD: u32 = 1 << 11;
pub const DEFAULT_BULK_SIZE: u32 = 4096;
pub const DEFAULT_DIR_BULK_SIZE: u32 = 4096;
pub const DEFAULT_DMAP_CACHE_SIZE: usize = 1 << 15;
pub const DEFAULT_DENT_CACHE_SIZE: usize = 1 << 15;

#[derive(Debug, Clone)]
pub struct OldDataImport {
    pub prefix: String,
    pub count: u32,
}

/// Parsed server configuration; every field defaults to the spec's stated
/// default so a config file only needs to mention what it overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub file_dir: Option<String>,
    pub db_root: Option<String>,
    pub db_home: Option<String>,
    pub db_split: Option<String>,
    pub old_data: Option<OldDataImport>,
    pub dir_split_threshold: u32,
    pub bulk_size: u32,
    pub dir_bulk_size: u32,
    pub dmap_cache_size: usize,
    pub dent_cache_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            file_dir: None,
            db_root: None,
            db_home: None,
            db_split: None,
            old_data: None,
            dir_split_threshold: DEFAULT_DIR_SPLIT_THRESHOLD,
            bulk_size: DEFAULT_BULK_SIZE,
            dir_bulk_size: DEFAULT_DIR_BULK_SIZE,
            dmap_cache_size: DEFAULT_DMAP_CACHE_SIZE,
            dent_cache_size: DEFAULT_DENT_CACHE_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, RpcError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, RpcError> {
        let mut cfg = ServerConfig::default();
        for (line_no, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = parse_entry(line).map_err(|e| {
                RpcError::BadConfig(format!("line {}: {}", line_no + 1, e))
            })?;
            apply_entry(&mut cfg, key, value)?;
        }
        Ok(cfg)
    }
}

fn parse_entry(line: &str) -> Result<(&str, &str), String> {
    fn parser(input: &str) -> IResult<&str, (&str, &str)> {
        let (input, key) = take_while1(|c: char| !c.is_whitespace())(input)?;
        let (input, value) = preceded(space1, rest)(input)?;
        Ok((input, (key, value.trim())))
    }
    parser(line)
        .map(|(_, pair)| pair)
        .map_err(|e| e.to_string())
}

fn apply_entry(cfg: &mut ServerConfig, key: &str, value: &str) -> Result<(), RpcError> {
    match key {
        "file_dir" => cfg.file_dir = Some(value.to_string()),
        "db_root" => cfg.db_root = Some(value.to_string()),
        "db_home" => cfg.db_home = Some(value.to_string()),
        "db_split" => cfg.db_split = Some(value.to_string()),
        "old_data" => {
            let mut parts = value.split_whitespace();
            let prefix = parts
                .next()
                .ok_or_else(|| RpcError::BadConfig("old_data needs a prefix".to_string()))?
                .to_string();
            let count = parts
                .next()
                .ok_or_else(|| RpcError::BadConfig("old_data needs a count".to_string()))?
                .parse::<u32>()
                .map_err(|e| RpcError::BadConfig(format!("old_data count: {e}")))?;
            cfg.old_data = Some(OldDataImport { prefix, count });
        }
        "FS_DIR_SPLIT_THR" => cfg.dir_split_threshold = parse_u32(value)?,
        "FS_BULK_SIZE" => cfg.bulk_size = parse_u32(value)?,
        "FS_DIR_BULK_SIZE" => cfg.dir_bulk_size = parse_u32(value)?,
        "FS_DMAP_CACHE_SIZE" => cfg.dmap_cache_size = parse_u32(value)? as usize,
        "FS_DENT_CACHE_SIZE" => cfg.dent_cache_size = parse_u32(value)? as usize,
        other => log::warn!("ignoring unrecognised config key {other:?}"),
    }
    Ok(())
}

fn parse_u32(value: &str) -> Result<u32, RpcError> {
    value
        .parse()
        .map_err(|e| RpcError::BadConfig(format!("expected an integer, got {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ServerConfig::parse("").unwrap();
        assert_eq!(cfg.dir_split_threshold, 2048);
        assert_eq!(cfg.dmap_cache_size, 32768);
    }

    #[test]
    fn overrides_recognised_keys() {
        let text = "\
            db_home /var/giga/db\n\
            FS_DIR_SPLIT_THR 64\n\
            old_data legacy 3\n\
        ";
        let cfg = ServerConfig::parse(text).unwrap();
        assert_eq!(cfg.db_home.as_deref(), Some("/var/giga/db"));
        assert_eq!(cfg.dir_split_threshold, 64);
        let old_data = cfg.old_data.unwrap();
        assert_eq!(old_data.prefix, "legacy");
        assert_eq!(old_data.count, 3);
    }

    #[test]
    fn unrecognised_keys_are_ignored_not_rejected() {
        let cfg = ServerConfig::parse("some_future_option 123\n").unwrap();
        assert_eq!(cfg.dir_split_threshold, DEFAULT_DIR_SPLIT_THRESHOLD);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# a comment\n\nFS_BULK_SIZE 10\n";
        let cfg = ServerConfig::parse(text).unwrap();
        assert_eq!(cfg.bulk_size, 10);
    }
}
