use std::io::Read;

use super::{le_u16, le_u64, read_section, text_field};
use crate::error::ParseError;

pub const VLR_HEADER_SIZE: usize = 54;
pub const EVLR_HEADER_SIZE: usize = 60;

/// GeoKeyDirectoryTag.
pub const GEO_KEY_DIRECTORY: u16 = 34735;
/// GeoDoubleParamsTag.
pub const GEO_DOUBLE_PARAMS: u16 = 34736;
/// GeoAsciiParamsTag.
pub const GEO_ASCII_PARAMS: u16 = 34737;
/// OGC coordinate system WKT.
pub const OGC_WKT: u16 = 2112;

/// A variable-length record. Records with ids the checker does not use are
/// kept as opaque payloads.
#[derive(Debug, Clone)]
pub struct Vlr {
    pub user_id: String,
    pub record_id: u16,
    pub description: String,
    pub payload: Vec<u8>,
    /// Read from the extended VLR area after the point data.
    pub extended: bool,
}

impl Vlr {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, ParseError> {
        let head = read_section(reader, VLR_HEADER_SIZE, "VLR header")?;
        let record_id = le_u16(&head, 18);
        let length = le_u16(&head, 20) as usize;
        let payload = read_section(reader, length, "VLR payload")?;

        Ok(Vlr {
            user_id: text_field(&head[2..18]),
            record_id,
            description: text_field(&head[22..54]),
            payload,
            extended: false,
        })
    }

    pub fn read_extended<R: Read>(reader: &mut R) -> Result<Self, ParseError> {
        let head = read_section(reader, EVLR_HEADER_SIZE, "EVLR header")?;
        let record_id = le_u16(&head, 18);
        let length = usize::try_from(le_u64(&head, 20)).map_err(|_| {
            ParseError::InvalidHeader(format!("EVLR {} length overflows", record_id))
        })?;
        let payload = read_section(reader, length, "EVLR payload")?;

        Ok(Vlr {
            user_id: text_field(&head[2..18]),
            record_id,
            description: text_field(&head[28..60]),
            payload,
            extended: true,
        })
    }

    /// Payload decoded as text up to the first NUL.
    pub fn payload_text(&self) -> String {
        text_field(&self.payload)
    }
}

/// Returns the first record with the given id, standard VLRs before EVLRs.
pub fn find_record(vlrs: &[Vlr], record_id: u16) -> Option<&Vlr> {
    vlrs.iter()
        .filter(|v| v.record_id == record_id)
        .min_by_key(|v| v.extended)
}
