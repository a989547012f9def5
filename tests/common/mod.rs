//! Synthetic LAS files for integration tests, written byte by byte.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub const GEO_KEY_DIRECTORY: u16 = 34735;
pub const GEO_ASCII_PARAMS: u16 = 34737;
pub const OGC_WKT: u16 = 2112;

pub const UTM19N_2011: &str = "NAD83(2011) / UTM zone 19N";
pub const NAVD88: &str = "NAVD88 height";

pub const COMPOUND_WKT: &str = concat!(
    r#"COMPD_CS["NAD83(2011) / UTM zone 19N + NAVD88 height","#,
    r#"PROJCS["NAD83(2011) / UTM zone 19N",GEOGCS["NAD83(2011)","#,
    r#"DATUM["NAD83_National_Spatial_Reference_System_2011",SPHEROID["GRS 1980",6378137,298.257222101]],"#,
    r#"PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],"#,
    r#"UNIT["metre",1],AUTHORITY["EPSG","6348"]],"#,
    r#"VERT_CS["NAVD88 height",VERT_DATUM["North American Vertical Datum 1988",2005],"#,
    r#"UNIT["metre",1],AUTHORITY["EPSG","5703"]]]"#
);

#[derive(Debug, Clone, Copy)]
pub struct TestPoint {
    pub class: u8,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub point_source_id: u16,
}

impl TestPoint {
    /// A single-return point.
    pub fn only(class: u8, point_source_id: u16) -> Self {
        Self {
            class,
            return_number: 1,
            number_of_returns: 1,
            point_source_id,
        }
    }

    /// The first of two returns.
    pub fn first_of_two(class: u8, point_source_id: u16) -> Self {
        Self {
            class,
            return_number: 1,
            number_of_returns: 2,
            point_source_id,
        }
    }
}

struct Record {
    user_id: &'static str,
    record_id: u16,
    payload: Vec<u8>,
}

pub struct LasBuilder {
    version_minor: u8,
    point_format: u8,
    global_encoding: u16,
    creation_day: u16,
    creation_year: u16,
    bounds: [f64; 4],
    points: Vec<TestPoint>,
    vlrs: Vec<Record>,
    evlrs: Vec<Record>,
}

impl LasBuilder {
    pub fn new(version_minor: u8, point_format: u8) -> Self {
        Self {
            version_minor,
            point_format,
            global_encoding: 0,
            creation_day: 32,
            creation_year: 2019,
            bounds: [374000.25, 374499.75, 4594000.5, 4594499.5],
            points: Vec::new(),
            vlrs: Vec::new(),
            evlrs: Vec::new(),
        }
    }

    /// LAS 1.2, format 1, GeoKeys with a GeoAscii vertical citation.
    pub fn legacy() -> Self {
        Self::new(2, 1)
            .geo_keys(&[[3072, 0, 1, 6348], [4097, GEO_ASCII_PARAMS, 14, 0]])
            .geo_ascii("NAVD88 height|")
    }

    /// LAS 1.4, format 6, satellite GPS time, authoritative compound WKT.
    pub fn modern() -> Self {
        Self::new(4, 6).global_encoding(0b1_0001).wkt(COMPOUND_WKT)
    }

    pub fn global_encoding(mut self, bits: u16) -> Self {
        self.global_encoding = bits;
        self
    }

    /// `[min_x, max_x, min_y, max_y]`
    pub fn bounds(mut self, bounds: [f64; 4]) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn point(mut self, point: TestPoint) -> Self {
        self.points.push(point);
        self
    }

    pub fn points(mut self, points: impl IntoIterator<Item = TestPoint>) -> Self {
        self.points.extend(points);
        self
    }

    /// GeoKey directory from `{KeyID, TIFFTagLocation, Count, ValueOffset}`
    /// groups.
    pub fn geo_keys(mut self, keys: &[[u16; 4]]) -> Self {
        let header = [1u16, 1, 0, keys.len() as u16];
        let payload = std::iter::once(&header)
            .chain(keys)
            .flat_map(|g| g.iter().flat_map(|v| v.to_le_bytes()))
            .collect();
        self.vlrs.push(Record {
            user_id: "LASF_Projection",
            record_id: GEO_KEY_DIRECTORY,
            payload,
        });
        self
    }

    pub fn geo_ascii(mut self, text: &str) -> Self {
        self.vlrs.push(Record {
            user_id: "LASF_Projection",
            record_id: GEO_ASCII_PARAMS,
            payload: text.as_bytes().to_vec(),
        });
        self
    }

    pub fn wkt(mut self, wkt: &str) -> Self {
        let mut payload = wkt.as_bytes().to_vec();
        payload.push(0);
        self.vlrs.push(Record {
            user_id: "LASF_Projection",
            record_id: OGC_WKT,
            payload,
        });
        self
    }

    pub fn without_vlrs(mut self) -> Self {
        self.vlrs.clear();
        self
    }

    /// WKT in an extended VLR after the point data.
    pub fn wkt_evlr(mut self, wkt: &str) -> Self {
        self.evlrs.push(Record {
            user_id: "LASF_Projection",
            record_id: OGC_WKT,
            payload: wkt.as_bytes().to_vec(),
        });
        self
    }

    fn header_size(&self) -> usize {
        match self.version_minor {
            0..=2 => 227,
            3 => 235,
            _ => 375,
        }
    }

    fn record_length(&self) -> usize {
        match self.point_format {
            0 => 20,
            1 => 28,
            2 => 26,
            3 => 34,
            6 => 30,
            7 => 36,
            other => panic!("test builder does not support format {other}"),
        }
    }

    fn point_bytes(&self, p: &TestPoint) -> Vec<u8> {
        let mut r = vec![0u8; self.record_length()];
        if self.point_format >= 6 {
            r[14] = (p.return_number & 0x0F) | (p.number_of_returns << 4);
            r[16] = p.class;
            r[20..22].copy_from_slice(&p.point_source_id.to_le_bytes());
        } else {
            r[14] = (p.return_number & 0x07) | ((p.number_of_returns & 0x07) << 3);
            r[15] = p.class;
            r[18..20].copy_from_slice(&p.point_source_id.to_le_bytes());
        }
        r
    }

    pub fn build(&self) -> Vec<u8> {
        let header_size = self.header_size();
        let vlr_bytes: usize = self.vlrs.iter().map(|v| 54 + v.payload.len()).sum();
        let offset_to_points = header_size + vlr_bytes;
        let point_bytes = self.points.len() * self.record_length();

        let mut h = vec![0u8; header_size];
        h[0..4].copy_from_slice(b"LASF");
        h[6..8].copy_from_slice(&self.global_encoding.to_le_bytes());
        h[24] = 1;
        h[25] = self.version_minor;
        h[26..33].copy_from_slice(b"TESTGEN");
        h[58..67].copy_from_slice(b"qchecker ");
        h[90..92].copy_from_slice(&self.creation_day.to_le_bytes());
        h[92..94].copy_from_slice(&self.creation_year.to_le_bytes());
        h[94..96].copy_from_slice(&(header_size as u16).to_le_bytes());
        h[96..100].copy_from_slice(&(offset_to_points as u32).to_le_bytes());
        h[100..104].copy_from_slice(&(self.vlrs.len() as u32).to_le_bytes());
        h[104] = self.point_format;
        h[105..107].copy_from_slice(&(self.record_length() as u16).to_le_bytes());
        h[107..111].copy_from_slice(&(self.points.len() as u32).to_le_bytes());
        for (i, scale) in [0.01f64, 0.01, 0.01].iter().enumerate() {
            h[131 + i * 8..139 + i * 8].copy_from_slice(&scale.to_le_bytes());
        }
        let [min_x, max_x, min_y, max_y] = self.bounds;
        for (at, v) in [(179, max_x), (187, min_x), (195, max_y), (203, min_y), (211, 10.0), (219, -30.0)] {
            h[at..at + 8].copy_from_slice(&f64::to_le_bytes(v));
        }
        if header_size >= 375 {
            if !self.evlrs.is_empty() {
                let evlr_start = (offset_to_points + point_bytes) as u64;
                h[235..243].copy_from_slice(&evlr_start.to_le_bytes());
                h[243..247].copy_from_slice(&(self.evlrs.len() as u32).to_le_bytes());
            }
            h[247..255].copy_from_slice(&(self.points.len() as u64).to_le_bytes());
        }

        let mut bytes = h;
        for vlr in &self.vlrs {
            let mut head = vec![0u8; 54];
            head[2..2 + vlr.user_id.len()].copy_from_slice(vlr.user_id.as_bytes());
            head[18..20].copy_from_slice(&vlr.record_id.to_le_bytes());
            head[20..22].copy_from_slice(&(vlr.payload.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&head);
            bytes.extend_from_slice(&vlr.payload);
        }
        for p in &self.points {
            bytes.extend(self.point_bytes(p));
        }
        for evlr in &self.evlrs {
            let mut head = vec![0u8; 60];
            head[2..2 + evlr.user_id.len()].copy_from_slice(evlr.user_id.as_bytes());
            head[18..20].copy_from_slice(&evlr.record_id.to_le_bytes());
            head[20..28].copy_from_slice(&(evlr.payload.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&head);
            bytes.extend_from_slice(&evlr.payload);
        }
        bytes
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.build()).unwrap();
        path.to_path_buf()
    }
}

/// Two flight lines over ground and bathymetry, plus first returns of other
/// classes that must not reach the surfaces.
pub fn survey_points(ground: u8, bathy: u8) -> Vec<TestPoint> {
    vec![
        TestPoint::only(ground, 101),
        TestPoint::only(bathy, 101),
        TestPoint::only(bathy, 101),
        TestPoint::first_of_two(1, 101),
        TestPoint::only(ground, 102),
        TestPoint::only(bathy, 102),
        TestPoint::first_of_two(5, 102),
    ]
}
