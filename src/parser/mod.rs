//! LAS container parsing: header, VLRs, GeoTIFF keys and a single pass over
//! the point records.

pub mod geokeys;
pub mod header;
pub mod points;
pub mod vlr;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::model::{TileCell, TileDescriptor};
use crate::srs::SpatialReferenceSource;
use geokeys::GeoKeyDirectory;
use header::LasHeader;
use points::{PointLayout, PointSummary};
use vlr::{find_record, Vlr, GEO_KEY_DIRECTORY, VLR_HEADER_SIZE};

/// Reads tiles into [`TileDescriptor`]s. The tile size drives the grid snap
/// of the centroid and footprint.
#[derive(Debug, Clone, Copy)]
pub struct TileMetadataReader {
    tile_size: f64,
}

/// Container-level content of one LAS file.
#[derive(Debug, Clone)]
pub struct LasContents {
    pub header: LasHeader,
    pub vlrs: Vec<Vlr>,
    pub geo_keys: Option<GeoKeyDirectory>,
    pub points: PointSummary,
}

impl TileMetadataReader {
    pub fn new(tile_size: f64) -> Self {
        Self { tile_size }
    }

    pub fn read(&self, path: &Path) -> Result<TileDescriptor, ParseError> {
        let file = File::open(path).map_err(|source| ParseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let contents = read_las(&mut BufReader::new(file))?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        debug!(
            tile = %name,
            version = %contents.header.version(),
            points = contents.points.point_count,
            vlrs = contents.vlrs.len(),
            "read tile metadata"
        );

        Ok(self.describe(path, name, contents))
    }

    /// Builds the descriptor from already parsed contents.
    pub fn describe(&self, path: &Path, name: String, contents: LasContents) -> TileDescriptor {
        let LasContents {
            header,
            vlrs,
            geo_keys,
            points,
        } = contents;
        let srs_source = SpatialReferenceSource::from_records(&header, &vlrs, geo_keys.as_ref());
        let cell = TileCell::snap(&header.bounds, self.tile_size);

        TileDescriptor::new(
            path.to_path_buf(),
            name,
            header,
            vlrs,
            geo_keys,
            srs_source,
            points,
            cell,
        )
    }
}

/// Parses a LAS stream: header, VLRs, point records and, for 1.4 files,
/// the extended VLRs that follow the points.
pub fn read_las<R: Read + Seek>(reader: &mut R) -> Result<LasContents, ParseError> {
    let header = LasHeader::read(reader)?;
    let layout = PointLayout::new(header.point_format, header.point_record_length)?;

    // The declared VLR count must fit before the point data.
    let vlr_area = (header.offset_to_point_data as u64).saturating_sub(reader.stream_position()?);
    if header.number_of_vlrs as u64 * VLR_HEADER_SIZE as u64 > vlr_area {
        return Err(ParseError::InvalidHeader(format!(
            "{} VLRs do not fit in the {} bytes before the point data",
            header.number_of_vlrs, vlr_area
        )));
    }
    let mut vlrs = Vec::new();
    for _ in 0..header.number_of_vlrs {
        vlrs.push(Vlr::read(reader)?);
    }

    let position = reader.stream_position()?;
    if (header.offset_to_point_data as u64) < position {
        return Err(ParseError::InvalidHeader(format!(
            "point data offset {} overlaps the VLR area ending at {}",
            header.offset_to_point_data, position
        )));
    }
    reader.seek(SeekFrom::Start(header.offset_to_point_data as u64))?;
    let points = PointSummary::scan(reader, layout, header.point_count)?;

    if let Some(start) = header.start_of_first_evlr {
        reader.seek(SeekFrom::Start(start))?;
        for _ in 0..header.number_of_evlrs {
            vlrs.push(Vlr::read_extended(reader)?);
        }
    }

    let geo_keys = find_record(&vlrs, GEO_KEY_DIRECTORY).map(|v| GeoKeyDirectory::decode(&v.payload));
    if geo_keys.is_none() && header.revision() == header::FormatRevision::Legacy {
        warn!("no GeoKey directory record in a pre-1.4 file");
    }

    Ok(LasContents {
        header,
        vlrs,
        geo_keys,
        points,
    })
}

/// Reads exactly `len` bytes, reporting how many were available on a short read.
/// `len` comes from the file, so the buffer grows with the bytes actually read.
pub(crate) fn read_section<R: Read>(
    reader: &mut R,
    len: usize,
    section: &'static str,
) -> Result<Vec<u8>, ParseError> {
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() < len {
        return Err(ParseError::Truncated {
            section,
            needed: len,
            available: buf.len(),
        });
    }
    Ok(buf)
}

pub(crate) fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn le_f64(buf: &[u8], offset: usize) -> f64 {
    f64::from_bits(le_u64(buf, offset))
}

/// Fixed-width text field: everything before the first NUL, lossily decoded.
pub(crate) fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}
