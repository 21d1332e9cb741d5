use std::{
    fs::File,
    io::{BufRead, BufReader, ErrorKind},
};

use anyhow::{Context, Result};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub ns_id: u32,
    pub host_id: u32,
    pub length: u32,
}

impl IdRange {
    fn flatten(&self) -> [u32; 3] {
        [self.ns_id, self.host_id, self.length]
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdMapTable {
    pub ranges: Vec<IdRange>,
}

impl IdMapTable {
    fn identity_only(host_id: u32) -> Self {
        Self {
            ranges: vec![IdRange {
                ns_id: 0,
                host_id,
                length: 1,
            }],
        }
    }

    pub fn args(&self) -> Vec<String> {
        self.ranges
            .iter()
            .flat_map(IdRange::flatten)
            .map(|n| n.to_string())
            .collect()
    }

    pub fn is_identity_only(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].ns_id == 0 && self.ranges[0].length == 1
    }

    pub fn max_ns_id(&self) -> u32 {
        self.ranges
            .iter()
            .map(|r| r.ns_id + r.length - 1)
            .max()
            .unwrap_or(0)
    }
}

struct SubIdAllocation {
    start: u32,
    count: u32,
}

fn read_allocations(filename: &str, login: &str) -> Result<Vec<SubIdAllocation>> {
    let file = match File::open(filename) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).with_context(|| format!("Failed to open {filename}")),
    };

    let mut allocations = vec![];
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read from {filename}"))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(3, ':');
        let (Some(name), Some(start), Some(count)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!("Malformed line in {filename}: {line:?}");
            continue;
        };

        if name != login {
            continue;
        }

        match (start.parse::<u32>(), count.parse::<u32>()) {
            (Ok(start), Ok(count)) if count >= 1 => {
                allocations.push(SubIdAllocation { start, count })
            }
            _ => warn!("Malformed numeric fields in {filename}: {line:?}"),
        }
    }

    Ok(allocations)
}

pub fn build_table(filename: &str, login: &str, host_id: u32) -> Result<IdMapTable> {
    let allocations = read_allocations(filename, login)?;

    if allocations.is_empty() {
        warn!(
            "No sub-id allocation for {login:?} in {filename}: \
             limited user/group support inside the sandbox"
        );
        return Ok(IdMapTable::identity_only(host_id));
    }

    let mut ranges = vec![IdRange {
        ns_id: 0,
        host_id,
        length: 1,
    }];

    let mut next_ns_id = 1;
    for alloc in allocations {
        ranges.push(IdRange {
            ns_id: next_ns_id,
            host_id: alloc.start,
            length: alloc.count,
        });
        next_ns_id += alloc.count;
    }

    Ok(IdMapTable { ranges })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_only_when_no_allocation() {
        let table = IdMapTable::identity_only(1000);
        assert!(table.is_identity_only());
        assert_eq!(table.args(), vec!["0", "1000", "1"]);
    }

    #[test]
    fn max_ns_id_covers_every_range() {
        let table = IdMapTable::identity_only(1000);
        assert_eq!(table.max_ns_id(), 0);

        let table = IdMapTable {
            ranges: vec![
                IdRange { ns_id: 0, host_id: 1000, length: 1 },
                IdRange { ns_id: 1, host_id: 100000, length: 65536 },
            ],
        };
        assert_eq!(table.max_ns_id(), 65536);
    }

    #[test]
    fn dense_table_appends_after_identity() {
        let table = IdMapTable {
            ranges: vec![
                IdRange {
                    ns_id: 0,
                    host_id: 1000,
                    length: 1,
                },
                IdRange {
                    ns_id: 1,
                    host_id: 100000,
                    length: 65536,
                },
            ],
        };
        assert!(!table.is_identity_only());
        assert_eq!(table.args(), vec!["0", "1000", "1", "1", "100000", "65536"]);
    }
}
