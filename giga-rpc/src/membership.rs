//! Static cluster membership: plain text, one `host port` line per
//! server, the line index is the server id (spec.md §6).

use crate::error::RpcError;
use nom::{
    bytes::complete::take_while1,
    character::complete::space1,
    combinator::{eof, map_res},
    sequence::terminated,
    IResult,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn is_host_char(c: char) -> bool {
    !c.is_whitespace()
}

fn parse_line(input: &str) -> IResult<&str, (String, u16)> {
    let (input, host) = take_while1(is_host_char)(input)?;
    let (input, _) = space1(input)?;
    let (input, port) = map_res(take_while1(|c: char| c.is_ascii_digit()), str::parse::<u16>)(input)?;
    Ok((input, (host.to_string(), port)))
}

/// `server_id -> host:port`, reloadable from disk between reconnect
/// attempts (spec.md §4.5: "re-reads the address from the membership map
/// between attempts").
#[derive(Debug, Clone)]
pub struct Membership {
    path: PathBuf,
    addrs: Vec<(String, u16)>,
}

impl Membership {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RpcError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path)?;
        let addrs = parse_membership(&contents)?;
        Ok(Membership { path, addrs })
    }

    /// Re-reads the file from disk in place, for the reconnect routine.
    pub fn reload(&mut self) -> Result<(), RpcError> {
        let contents = std::fs::read_to_string(&self.path)?;
        self.addrs = parse_membership(&contents)?;
        Ok(())
    }

    pub fn n_servers(&self) -> i64 {
        self.addrs.len() as i64
    }

    pub fn addr(&self, server_id: i32) -> Result<String, RpcError> {
        self.addrs
            .get(server_id as usize)
            .map(|(host, port)| format!("{host}:{port}"))
            .ok_or(RpcError::UnknownServer(server_id))
    }

    pub fn uri(&self, server_id: i32) -> Result<String, RpcError> {
        Ok(format!("http://{}", self.addr(server_id)?))
    }

    pub fn as_map(&self) -> HashMap<i32, String> {
        self.addrs
            .iter()
            .enumerate()
            .map(|(id, (host, port))| (id as i32, format!("{host}:{port}")))
            .collect()
    }
}

fn parse_membership(contents: &str) -> Result<Vec<(String, u16)>, RpcError> {
    let mut addrs = Vec::new();
    for (line_no, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (_, addr) = terminated(parse_line, eof)(line).map_err(|e| RpcError::BadMembership {
            line: line_no + 1,
            reason: e.to_string(),
        })?;
        addrs.push(addr);
    }
    Ok(addrs)
}

pub fn write_membership_file(path: &Path, addrs: &[(String, u16)]) -> std::io::Result<()> {
    let body: String = addrs
        .iter()
        .map(|(host, port)| format!("{host} {port}\n"))
        .collect();
    std::fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_line_per_server_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("members");
        write_membership_file(&path, &[("10.0.0.1".into(), 9090), ("10.0.0.2".into(), 9090)]).unwrap();

        let membership = Membership::load(&path).unwrap();
        assert_eq!(membership.n_servers(), 2);
        assert_eq!(membership.addr(0).unwrap(), "10.0.0.1:9090");
        assert_eq!(membership.addr(1).unwrap(), "10.0.0.2:9090");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("members");
        std::fs::write(&path, "host1 1\n\nhost2 2\n").unwrap();
        let membership = Membership::load(&path).unwrap();
        assert_eq!(membership.n_servers(), 2);
    }

    #[test]
    fn unknown_server_id_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("members");
        write_membership_file(&path, &[("h".into(), 1)]).unwrap();
        let membership = Membership::load(&path).unwrap();
        assert!(matches!(membership.addr(5), Err(RpcError::UnknownServer(5))));
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("members");
        write_membership_file(&path, &[("a".into(), 1)]).unwrap();
        let mut membership = Membership::load(&path).unwrap();
        write_membership_file(&path, &[("a".into(), 1), ("b".into(), 2)]).unwrap();
        membership.reload().unwrap();
        assert_eq!(membership.n_servers(), 2);
    }
}
