use std::collections::BTreeMap;
use tracing::warn;

use super::le_u16;

/// ProjectedCSTypeGeoKey.
pub const PROJECTED_CS_TYPE: u16 = 3072;
/// PCSCitationGeoKey.
pub const PCS_CITATION: u16 = 3073;
/// VerticalCSTypeGeoKey.
pub const VERTICAL_CS_TYPE: u16 = 4096;
/// VerticalCitationGeoKey.
pub const VERTICAL_CITATION: u16 = 4097;
/// GeoTIFF code for a user-defined coordinate system.
pub const USER_DEFINED: u16 = 32767;

const ENTRY_SIZE: usize = 8;

/// One `{KeyID, TIFFTagLocation, Count, ValueOffset}` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoKeyEntry {
    /// 0 when `value_offset` holds the value itself, otherwise the tag of
    /// the params record holding it.
    pub tiff_tag_location: u16,
    pub count: u16,
    pub value_offset: u16,
}

/// Decoded GeoKeyDirectoryTag record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoKeyDirectory {
    pub key_directory_version: u16,
    pub key_revision: u16,
    pub minor_revision: u16,
    /// Key count declared in the directory header. Not trusted for decoding.
    pub declared_keys: u16,
    pub keys: BTreeMap<u16, GeoKeyEntry>,
}

impl GeoKeyDirectory {
    /// Decodes the record by consuming 4-field groups until the payload is
    /// exhausted. The first group is the directory header.
    pub fn decode(payload: &[u8]) -> Self {
        let mut groups = payload.chunks_exact(ENTRY_SIZE);
        let mut directory = GeoKeyDirectory::default();

        if let Some(header) = groups.next() {
            directory.key_directory_version = le_u16(header, 0);
            directory.key_revision = le_u16(header, 2);
            directory.minor_revision = le_u16(header, 4);
            directory.declared_keys = le_u16(header, 6);
        }

        for group in groups.by_ref() {
            let key_id = le_u16(group, 0);
            directory.keys.insert(
                key_id,
                GeoKeyEntry {
                    tiff_tag_location: le_u16(group, 2),
                    count: le_u16(group, 4),
                    value_offset: le_u16(group, 6),
                },
            );
        }

        let remainder = groups.remainder().len();
        if remainder > 0 {
            warn!("GeoKey directory has {} trailing bytes; ignored", remainder);
        }
        if directory.declared_keys as usize != directory.keys.len() {
            warn!(
                "GeoKey directory declares {} keys but holds {}",
                directory.declared_keys,
                directory.keys.len()
            );
        }

        directory
    }

    pub fn get(&self, key_id: u16) -> Option<&GeoKeyEntry> {
        self.keys.get(&key_id)
    }

    /// Value of a key stored inline (`TIFFTagLocation == 0`).
    pub fn short_value(&self, key_id: u16) -> Option<u16> {
        self.get(key_id)
            .filter(|e| e.tiff_tag_location == 0)
            .map(|e| e.value_offset)
    }

    /// Text of a key stored in the GeoAsciiParams record, located by the
    /// entry's `(ValueOffset, Count)` pair, without the `|` terminator.
    pub fn ascii_value(&self, key_id: u16, ascii_params: &[u8]) -> Option<String> {
        let entry = self.get(key_id)?;
        if entry.tiff_tag_location != super::vlr::GEO_ASCII_PARAMS {
            return None;
        }
        let start = entry.value_offset as usize;
        let end = (start + entry.count as usize).min(ascii_params.len());
        if start >= end {
            return None;
        }
        let text = String::from_utf8_lossy(&ascii_params[start..end]);
        let text = text.trim_end_matches(['|', '\0']).trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}
