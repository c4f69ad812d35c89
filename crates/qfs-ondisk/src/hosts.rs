use qfs_types::{
    DEV_BSIZE, ParseError, ensure_slice, nul_padded, read_fixed, read_le_u32, trim_nul_padded,
    write_bytes, write_le_u32,
};
use serde::{Deserialize, Serialize};

const HOSTS_HEADER_SIZE: usize = 16;
const HOST_NAME_SIZE: usize = 32;
/// Hosts that fit in the table block.
pub const MAX_HOSTS: usize = (DEV_BSIZE as usize - HOSTS_HEADER_SIZE) / HOST_NAME_SIZE;

/// Shared-filesystem host table (first block of `.hosts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsTable {
    pub version: u32,
    /// Index of the current metadata server in `hosts`.
    pub server: u32,
    pub hosts: Vec<String>,
}

impl HostsTable {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, HOSTS_HEADER_SIZE)?;
        let version = read_le_u32(bytes, 0x00)?;
        let count = usize::try_from(read_le_u32(bytes, 0x04)?)
            .map_err(|_| ParseError::IntegerConversion { field: "hosts_count" })?;
        let server = read_le_u32(bytes, 0x08)?;
        if count == 0 || count > MAX_HOSTS {
            return Err(ParseError::InvalidField {
                field: "hosts_count",
                reason: "must be in 1..=31",
            });
        }
        if server as usize >= count {
            return Err(ParseError::InvalidField {
                field: "hosts_server",
                reason: "server index outside host list",
            });
        }
        let hosts = (0..count)
            .map(|i| {
                let raw = read_fixed::<HOST_NAME_SIZE>(bytes, HOSTS_HEADER_SIZE + i * HOST_NAME_SIZE)?;
                Ok(trim_nul_padded(&raw))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            version,
            server,
            hosts,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; DEV_BSIZE as usize];
        let count = u32::try_from(self.hosts.len())
            .map_err(|_| ParseError::IntegerConversion { field: "hosts_count" })?;
        write_le_u32(&mut block, 0x00, self.version)?;
        write_le_u32(&mut block, 0x04, count)?;
        write_le_u32(&mut block, 0x08, self.server)?;
        for (i, host) in self.hosts.iter().enumerate() {
            write_bytes(
                &mut block,
                HOSTS_HEADER_SIZE + i * HOST_NAME_SIZE,
                &nul_padded::<HOST_NAME_SIZE>(host),
            )?;
        }
        Ok(block)
    }

    /// Name of the metadata server.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.hosts.get(self.server as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_round_trip() {
        let table = HostsTable {
            version: 1,
            server: 1,
            hosts: vec!["alpha".into(), "beta".into()],
        };
        let bytes = table.to_bytes().expect("serialize");
        let parsed = HostsTable::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, table);
        assert_eq!(parsed.server_name(), Some("beta"));
    }

    #[test]
    fn server_outside_list_rejected() {
        let table = HostsTable {
            version: 1,
            server: 2,
            hosts: vec!["alpha".into()],
        };
        let bytes = table.to_bytes().expect("serialize");
        assert!(HostsTable::parse_from_bytes(&bytes).is_err());
    }
}
