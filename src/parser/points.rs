use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;

use super::{le_u16, read_section};
use crate::error::ParseError;

/// Records decoded per read call.
const CHUNK_POINTS: usize = 65_536;

/// Byte positions of the fields the checker needs within one point record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointLayout {
    pub format: u8,
    pub record_length: usize,
    extended: bool,
}

/// The per-point attributes read during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointFields {
    pub classification: u8,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub point_source_id: u16,
}

impl PointFields {
    /// Last of several returns, or the only one.
    pub fn is_last_return(&self) -> bool {
        self.return_number == self.number_of_returns
    }
}

impl PointLayout {
    pub fn new(format: u8, record_length: u16) -> Result<Self, ParseError> {
        let minimum: u16 = match format {
            0 => 20,
            1 => 28,
            2 => 26,
            3 => 34,
            4 => 57,
            5 => 63,
            6 => 30,
            7 => 36,
            8 => 38,
            9 => 59,
            10 => 67,
            other => return Err(ParseError::UnsupportedPointFormat(other)),
        };
        if record_length < minimum {
            return Err(ParseError::RecordTooShort {
                format,
                length: record_length,
                minimum,
            });
        }
        Ok(PointLayout {
            format,
            record_length: record_length as usize,
            extended: format >= 6,
        })
    }

    pub fn decode(&self, record: &[u8]) -> PointFields {
        if self.extended {
            let returns = record[14];
            PointFields {
                return_number: returns & 0x0F,
                number_of_returns: returns >> 4,
                classification: record[16],
                point_source_id: le_u16(record, 20),
            }
        } else {
            let returns = record[14];
            PointFields {
                return_number: returns & 0x07,
                number_of_returns: (returns >> 3) & 0x07,
                // Upper three bits are the synthetic/key-point/withheld flags.
                classification: record[15] & 0x1F,
                point_source_id: le_u16(record, 18),
            }
        }
    }
}

/// Per flight line counts gathered during the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlightLine {
    pub point_count: u64,
    /// Class histogram of last (or only) returns.
    pub last_return_classes: BTreeMap<u8, u64>,
}

impl FlightLine {
    pub fn has_last_returns_in(&self, classes: &[u8]) -> bool {
        classes
            .iter()
            .any(|c| self.last_return_classes.get(c).copied().unwrap_or(0) > 0)
    }
}

/// Everything the checker learns from one pass over the point records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointSummary {
    pub point_count: u64,
    pub class_counts: BTreeMap<u8, u64>,
    pub flight_lines: BTreeMap<u16, FlightLine>,
}

struct LineAccumulator {
    point_count: u64,
    last_return_classes: [u64; 256],
}

impl PointSummary {
    /// Scans `count` records of the given layout, counting classes and
    /// flight lines in a single pass.
    pub fn scan<R: Read>(reader: &mut R, layout: PointLayout, count: u64) -> Result<Self, ParseError> {
        let mut class_counts = [0u64; 256];
        let mut lines: HashMap<u16, LineAccumulator> = HashMap::new();

        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(CHUNK_POINTS as u64) as usize;
            let chunk = read_section(reader, batch * layout.record_length, "point data")?;

            for record in chunk.chunks_exact(layout.record_length) {
                let point = layout.decode(record);
                class_counts[point.classification as usize] += 1;

                let line = lines
                    .entry(point.point_source_id)
                    .or_insert_with(|| LineAccumulator {
                        point_count: 0,
                        last_return_classes: [0; 256],
                    });
                line.point_count += 1;
                if point.is_last_return() {
                    line.last_return_classes[point.classification as usize] += 1;
                }
            }
            remaining -= batch as u64;
        }

        Ok(PointSummary {
            point_count: count,
            class_counts: sparse(&class_counts),
            flight_lines: lines
                .into_iter()
                .map(|(id, acc)| {
                    (
                        id,
                        FlightLine {
                            point_count: acc.point_count,
                            last_return_classes: sparse(&acc.last_return_classes),
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn classes_present(&self) -> BTreeSet<u8> {
        self.class_counts.keys().copied().collect()
    }

    pub fn has_class(&self, class: u8) -> bool {
        self.class_counts.contains_key(&class)
    }

    /// Distinct flight-line identifiers, ascending.
    pub fn point_source_ids(&self) -> Vec<u16> {
        self.flight_lines.keys().copied().collect()
    }
}

fn sparse(counts: &[u64; 256]) -> BTreeMap<u8, u64> {
    counts
        .iter()
        .enumerate()
        .filter(|(_, &n)| n > 0)
        .map(|(class, &n)| (class as u8, n))
        .collect()
}
