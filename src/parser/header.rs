use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::io::Read;

use super::{le_f64, le_u16, le_u32, le_u64, read_section, text_field};
use crate::error::ParseError;

pub const LAS_SIGNATURE: &[u8; 4] = b"LASF";

/// Size of the header block common to every 1.x revision.
pub const BASE_HEADER_SIZE: usize = 227;
const HEADER_SIZE_1_3: usize = 235;
const HEADER_SIZE_1_4: usize = 375;

/// Global encoding bit 0: GPS time is standard (satellite) GPS time.
const GPS_TIME_TYPE_BIT: u16 = 1 << 0;
/// Global encoding bit 4: the coordinate system is stored as OGC WKT.
const WKT_BIT: u16 = 1 << 4;

/// The two container revisions the checker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FormatRevision {
    /// LAS 1.0 through 1.3: GeoTIFF keys, legacy point formats.
    Legacy,
    /// LAS 1.4: OGC WKT, extended point formats.
    Modern,
}

impl FormatRevision {
    pub fn from_version(major: u8, minor: u8) -> Result<Self, ParseError> {
        match (major, minor) {
            (1, 0..=3) => Ok(FormatRevision::Legacy),
            (1, 4) => Ok(FormatRevision::Modern),
            _ => Err(ParseError::UnsupportedVersion { major, minor }),
        }
    }
}

/// Time reference convention selected by bit 0 of the global encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsTimeType {
    GpsWeekTime,
    SatelliteGpsTime,
}

impl GpsTimeType {
    pub fn from_global_encoding(global_encoding: u16) -> Self {
        if global_encoding & GPS_TIME_TYPE_BIT == 0 {
            GpsTimeType::GpsWeekTime
        } else {
            GpsTimeType::SatelliteGpsTime
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GpsTimeType::GpsWeekTime => "GPS Week Time",
            GpsTimeType::SatelliteGpsTime => "Satellite GPS Time",
        }
    }
}

impl fmt::Display for GpsTimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Data extents recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

/// Public header block of a LAS file.
#[derive(Debug, Clone)]
pub struct LasHeader {
    pub file_source_id: u16,
    pub global_encoding: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub system_identifier: String,
    pub generating_software: String,
    pub creation_day: u16,
    pub creation_year: u16,
    pub header_size: u16,
    pub offset_to_point_data: u32,
    pub number_of_vlrs: u32,
    /// Point data record format with the compression bits masked off.
    pub point_format: u8,
    pub point_record_length: u16,
    pub point_count: u64,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub bounds: Bounds,
    pub start_of_first_evlr: Option<u64>,
    pub number_of_evlrs: u32,
}

impl LasHeader {
    /// Reads the header block, leaving the reader positioned at the first VLR.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, ParseError> {
        let base = read_section(reader, BASE_HEADER_SIZE, "header")?;

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&base[0..4]);
        if &signature != LAS_SIGNATURE {
            return Err(ParseError::NotLas { found: signature });
        }

        let version_major = base[24];
        let version_minor = base[25];
        let revision = FormatRevision::from_version(version_major, version_minor)?;

        let header_size = le_u16(&base, 94);
        if (header_size as usize) < BASE_HEADER_SIZE {
            return Err(ParseError::InvalidHeader(format!(
                "header size {} is smaller than the {} byte minimum",
                header_size, BASE_HEADER_SIZE
            )));
        }

        let extra = if header_size as usize > BASE_HEADER_SIZE {
            read_section(reader, header_size as usize - BASE_HEADER_SIZE, "header")?
        } else {
            Vec::new()
        };

        let format_byte = base[104];
        if format_byte & 0xC0 != 0 {
            return Err(ParseError::Compressed(format_byte));
        }
        let point_format = format_byte & 0x3F;
        let point_record_length = le_u16(&base, 105);

        let legacy_point_count = le_u32(&base, 107) as u64;

        // 1.3 adds the waveform offset, 1.4 the EVLR pointer and 64-bit counts.
        let mut start_of_first_evlr = None;
        let mut number_of_evlrs = 0;
        let mut point_count = legacy_point_count;
        if revision == FormatRevision::Modern && header_size as usize >= HEADER_SIZE_1_4 {
            let evlr_start = le_u64(&extra, HEADER_SIZE_1_3 - BASE_HEADER_SIZE);
            number_of_evlrs = le_u32(&extra, HEADER_SIZE_1_3 - BASE_HEADER_SIZE + 8);
            if evlr_start > 0 && number_of_evlrs > 0 {
                start_of_first_evlr = Some(evlr_start);
            }
            let extended_count = le_u64(&extra, HEADER_SIZE_1_3 - BASE_HEADER_SIZE + 12);
            if extended_count > 0 {
                point_count = extended_count;
            }
        }

        Ok(LasHeader {
            file_source_id: le_u16(&base, 4),
            global_encoding: le_u16(&base, 6),
            version_major,
            version_minor,
            system_identifier: text_field(&base[26..58]),
            generating_software: text_field(&base[58..90]),
            creation_day: le_u16(&base, 90),
            creation_year: le_u16(&base, 92),
            header_size,
            offset_to_point_data: le_u32(&base, 96),
            number_of_vlrs: le_u32(&base, 100),
            point_format,
            point_record_length,
            point_count,
            scale: [le_f64(&base, 131), le_f64(&base, 139), le_f64(&base, 147)],
            offset: [le_f64(&base, 155), le_f64(&base, 163), le_f64(&base, 171)],
            bounds: Bounds {
                max_x: le_f64(&base, 179),
                min_x: le_f64(&base, 187),
                max_y: le_f64(&base, 195),
                min_y: le_f64(&base, 203),
                max_z: le_f64(&base, 211),
                min_z: le_f64(&base, 219),
            },
            start_of_first_evlr,
            number_of_evlrs,
        })
    }

    /// Version string as written in result records, e.g. `"1.4"`.
    pub fn version(&self) -> String {
        format!("{}.{}", self.version_major, self.version_minor)
    }

    pub fn revision(&self) -> FormatRevision {
        // Validated in `read`.
        if self.version_minor >= 4 {
            FormatRevision::Modern
        } else {
            FormatRevision::Legacy
        }
    }

    pub fn gps_time_type(&self) -> GpsTimeType {
        GpsTimeType::from_global_encoding(self.global_encoding)
    }

    /// Whether the WKT bit is set, i.e. the WKT record is authoritative.
    pub fn wkt_flag(&self) -> bool {
        self.global_encoding & WKT_BIT != 0
    }

    /// Calendar date built from the creation day-of-year and year, if valid.
    pub fn creation_date(&self) -> Option<NaiveDate> {
        if self.creation_day == 0 {
            return None;
        }
        NaiveDate::from_yo_opt(self.creation_year as i32, self.creation_day as u32)
    }
}
