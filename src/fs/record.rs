// 16-byte fake-metadata record, big-endian on disk, stored in the
// user.grootfs xattr (or a sidecar file for symlinks). Any read whose
// length isn't exactly 16 is rejected.

use anyhow::{Result, bail};

pub const RECORD_LEN: usize = 16;

const FLAG_UID: u32 = 1 << 0;
const FLAG_GID: u32 = 1 << 1;
const FLAG_MODE: u32 = 1 << 2;

const MODE_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeRecord {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

impl FakeRecord {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            bail!(
                "corrupt grootfs fake record: expected {RECORD_LEN} bytes, got {}",
                bytes.len()
            );
        }

        let flags = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let uid = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let gid = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let mode = u32::from_be_bytes(bytes[12..16].try_into().unwrap());

        Ok(Self {
            uid: (flags & FLAG_UID != 0).then_some(uid),
            gid: (flags & FLAG_GID != 0).then_some(gid),
            mode: (flags & FLAG_MODE != 0).then_some(mode & MODE_MASK),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut flags = 0u32;
        if self.uid.is_some() {
            flags |= FLAG_UID;
        }
        if self.gid.is_some() {
            flags |= FLAG_GID;
        }
        if self.mode.is_some() {
            flags |= FLAG_MODE;
        }

        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.uid.unwrap_or(0).to_be_bytes());
        out[8..12].copy_from_slice(&self.gid.unwrap_or(0).to_be_bytes());
        out[12..16].copy_from_slice(&(self.mode.unwrap_or(0) & MODE_MASK).to_be_bytes());
        out
    }

    // fields present in `update` replace the corresponding field in self;
    // the read-modify-write step every chmod/chown performs.
    pub fn merged_with(&self, update: FakeRecord) -> FakeRecord {
        FakeRecord {
            uid: update.uid.or(self.uid),
            gid: update.gid.or(self.gid),
            mode: update.mode.map(|m| m & MODE_MASK).or(self.mode),
        }
    }

    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode: Some(mode & MODE_MASK),
            ..Default::default()
        }
    }

    pub fn with_owner(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let record = FakeRecord {
            uid: Some(1000),
            gid: Some(1000),
            mode: Some(0o4755),
        };
        assert_eq!(FakeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(FakeRecord::decode(&[0u8; 15]).is_err());
        assert!(FakeRecord::decode(&[0u8; 17]).is_err());
    }

    #[test]
    fn missing_attribute_is_all_zero() {
        // Callers translate "attribute absent" into an empty byte slice
        // being skipped entirely, never into decode(); this just confirms
        // the zero-flags record (what you'd get from 16 zero bytes) claims
        // nothing.
        let record = FakeRecord::decode(&[0u8; RECORD_LEN]).unwrap();
        assert_eq!(record, FakeRecord::default());
    }

    #[test]
    fn merge_is_last_writer_wins_per_field() {
        let base = FakeRecord {
            uid: Some(1),
            gid: Some(2),
            mode: Some(0o755),
        };
        let update = FakeRecord::with_owner(9, 9);
        let merged = base.merged_with(update);
        assert_eq!(merged.uid, Some(9));
        assert_eq!(merged.gid, Some(9));
        assert_eq!(merged.mode, Some(0o755));
    }

    #[test]
    fn mode_is_masked_to_permission_bits() {
        let record = FakeRecord::with_mode(0o170755);
        assert_eq!(record.mode, Some(0o0755));
    }
}
