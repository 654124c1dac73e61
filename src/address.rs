use std::fmt;

use crate::error::ConfigError;

pub const MAX_ADDRESSES: usize = 4;

/// Endpoints reachable through the machine feeder. Order is selection
/// priority; entry 0 is the bridge's own address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AddressTable {
    entries: [u8; MAX_ADDRESSES],
    len: usize,
}

impl AddressTable {
    pub fn new(addresses: &[u8]) -> Result<Self, ConfigError> {
        if addresses.is_empty() {
            return Err(ConfigError::EmptyAddressTable);
        }
        if addresses.len() > MAX_ADDRESSES {
            return Err(ConfigError::AddressTableTooLarge(addresses.len()));
        }
        let mut entries = [0; MAX_ADDRESSES];
        for (i, &address) in addresses.iter().enumerate() {
            if addresses[..i].contains(&address) {
                return Err(ConfigError::DuplicateAddress(address));
            }
            entries[i] = address;
        }
        Ok(Self {
            entries,
            len: addresses.len(),
        })
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    pub fn default_address(&self) -> u8 {
        self.entries[0]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.entries[..self.len]
    }
}

/// Four slots: three device addresses and the zero (general call) address.
impl Default for AddressTable {
    fn default() -> Self {
        Self {
            entries: [0x5A, 0x5B, 0x5C, 0x00],
            len: MAX_ADDRESSES,
        }
    }
}

impl fmt::Debug for AddressTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressTable({:02X?})", self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = AddressTable::default();
        assert_eq!(table.as_slice(), &[0x5A, 0x5B, 0x5C, 0x00]);
        assert_eq!(table.default_address(), 0x5A);
        assert_eq!(table.get(2), Some(0x5C));
        assert_eq!(table.get(4), None);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert_eq!(AddressTable::new(&[]), Err(ConfigError::EmptyAddressTable));
        assert_eq!(
            AddressTable::new(&[1, 2, 3, 4, 5]),
            Err(ConfigError::AddressTableTooLarge(5))
        );
        assert_eq!(
            AddressTable::new(&[0x5A, 0x5B, 0x5A]),
            Err(ConfigError::DuplicateAddress(0x5A))
        );
    }

    #[test]
    fn test_short_table() {
        let table = AddressTable::new(&[0x20, 0x21]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(2), None);
        assert_eq!(format!("{table:?}"), "AddressTable([20, 21])");
    }
}
