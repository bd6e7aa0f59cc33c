//! Pinned kernel LPM trie as a [`BackingMap`].

use std::path::Path;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Map, MapData};
use tracing::debug;

use crate::entry::{V4_ENTRY_SIZE, V6_ENTRY_SIZE};
use crate::error::MapError;
use crate::map::{BackingMap, IterAction};

const PREFIX_FIELD: usize = 4;

/// IP sets LPM trie with `N` bytes of key data after the prefix length.
pub struct AyaIpSetsMap<const N: usize> {
    trie: LpmTrie<MapData, [u8; N], u32>,
}

pub type AyaIpSetsMapV4 = AyaIpSetsMap<{ V4_ENTRY_SIZE - PREFIX_FIELD }>;
pub type AyaIpSetsMapV6 = AyaIpSetsMap<{ V6_ENTRY_SIZE - PREFIX_FIELD }>;

impl<const N: usize> AyaIpSetsMap<N> {
    /// Opens a map pinned on bpffs.
    pub fn from_pin(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let data = MapData::from_pin(path).map_err(|e| MapError::Iter(e.to_string()))?;
        let trie = LpmTrie::try_from(Map::LpmTrie(data)).map_err(|e| MapError::Iter(e.to_string()))?;
        debug!(path = %path.display(), "Opened pinned IP sets map");
        Ok(Self { trie })
    }

    fn to_key(raw: &[u8]) -> Option<Key<[u8; N]>> {
        if raw.len() != PREFIX_FIELD + N {
            return None;
        }
        let prefix_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut data = [0u8; N];
        data.copy_from_slice(&raw[PREFIX_FIELD..]);
        Some(Key::new(prefix_len, data))
    }

    fn to_raw(key: &Key<[u8; N]>) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PREFIX_FIELD + N);
        raw.extend_from_slice(&key.prefix_len().to_le_bytes());
        raw.extend_from_slice(&key.data());
        raw
    }
}

impl<const N: usize> BackingMap for AyaIpSetsMap<N> {
    fn iter(
        &mut self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> IterAction,
    ) -> Result<(), MapError> {
        // Snapshot first; deleting while walking the kernel iterator skips keys.
        let entries = self
            .trie
            .iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MapError::Iter(e.to_string()))?;
        for (key, value) in entries {
            match visit(&Self::to_raw(&key), &value.to_le_bytes()) {
                IterAction::Continue => {}
                IterAction::Stop => break,
                IterAction::Delete => self
                    .trie
                    .remove(&key)
                    .map_err(|e| MapError::Delete(e.to_string()))?,
            }
        }
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        let key = Self::to_key(key)
            .ok_or_else(|| MapError::Update(format!("bad key length {}", key.len())))?;
        let value: [u8; 4] = value
            .try_into()
            .map_err(|_| MapError::Update(format!("bad value length {}", value.len())))?;
        self.trie
            .insert(&key, u32::from_le_bytes(value), 0)
            .map_err(|e| MapError::Update(e.to_string()))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError> {
        let key = Self::to_key(key)
            .ok_or_else(|| MapError::Delete(format!("bad key length {}", key.len())))?;
        self.trie
            .remove(&key)
            .map_err(|e| MapError::Delete(e.to_string()))
    }
}
