//! Streaming LAMMPS dump reader.
//!
//! A dump file is a sequence of frames, each introduced by `ITEM: TIMESTEP`:
//!
//! ```text
//! ITEM: TIMESTEP
//! 100
//! ITEM: NUMBER OF ATOMS
//! 2
//! ITEM: BOX BOUNDS pp pp pp
//! 0.0 10.0
//! 0.0 10.0
//! 0.0 10.0
//! ITEM: ATOMS id type x y z
//! 1 1 0.5 0.5 0.5
//! 2 1 1.5 1.5 1.5
//! ```
//!
//! [`DumpReader`] reads one frame at a time. A malformed frame yields an
//! error and the reader skips ahead to the next `ITEM: TIMESTEP`, so frames
//! already emitted and frames after the bad one are unaffected.

use crate::frame::TrajectoryFrame;
use std::io::BufRead;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Largest row count pre-allocated from a header before any row is read.
const MAX_PREALLOCATED_ATOMS: u64 = 1 << 22;

/// Errors raised while decoding a single frame.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A required `ITEM:` section never appeared.
    #[error("missing section ITEM: {0}")]
    MissingSection(&'static str),

    /// A header line could not be understood.
    #[error("invalid header at line {line}: {reason}")]
    InvalidHeader { line: usize, reason: String },

    /// A required atom column is absent from `ITEM: ATOMS`.
    #[error("required column '{0}' missing from ITEM: ATOMS")]
    MissingColumn(&'static str),

    /// The number of atom rows disagrees with `ITEM: NUMBER OF ATOMS`.
    #[error("atom count mismatch: header declares {declared}, decoded {decoded}")]
    AtomCountMismatch { declared: u64, decoded: u64 },

    /// A per-atom value could not be decoded.
    #[error("invalid value '{value}' for column '{column}' at line {line}")]
    InvalidValue {
        line: usize,
        column: String,
        value: String,
    },

    /// Underlying reader failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame that could not be decoded, with whatever header context was read.
#[derive(Debug, Error)]
#[error("frame starting at line {start_line} (timestep {timestep:?}): {error}")]
pub struct FrameFailure {
    /// Timestep, if the header got that far.
    pub timestep: Option<u64>,

    /// Line number of the frame's first line.
    pub start_line: usize,

    /// The decoding error.
    #[source]
    pub error: ParseError,
}

/// Outcome of reading a whole dump: every frame lands in exactly one list.
#[derive(Debug, Default)]
pub struct ParseReport {
    /// Successfully decoded frames, in file order.
    pub frames: Vec<TrajectoryFrame>,

    /// Frames that failed, in file order.
    pub failures: Vec<FrameFailure>,
}

impl ParseReport {
    /// Total number of frames encountered.
    pub fn total(&self) -> usize {
        self.frames.len() + self.failures.len()
    }
}

/// Column positions resolved from an `ITEM: ATOMS` header.
#[derive(Debug, Clone, Copy)]
struct ColumnLayout {
    id: usize,
    kind: Option<usize>,
    axes: [usize; 3],
    width: usize,
}

impl ColumnLayout {
    fn resolve(columns: &[String]) -> Result<Self, ParseError> {
        let mut id = None;
        let mut kind = None;
        let mut axes: [Option<usize>; 3] = [None; 3];

        for (index, name) in columns.iter().enumerate() {
            match name.as_str() {
                "id" => {
                    id.get_or_insert(index);
                }
                "type" => {
                    kind.get_or_insert(index);
                }
                other if (1..=2).contains(&other.len()) => {
                    let axis = match other.as_bytes()[0] {
                        b'x' => Some(0),
                        b'y' => Some(1),
                        b'z' => Some(2),
                        _ => None,
                    };
                    if let Some(axis) = axis {
                        axes[axis].get_or_insert(index);
                    }
                }
                _ => {}
            }
        }

        let id = id.ok_or(ParseError::MissingColumn("id"))?;
        let x = axes[0].ok_or(ParseError::MissingColumn("x"))?;
        let y = axes[1].ok_or(ParseError::MissingColumn("y"))?;
        let z = axes[2].ok_or(ParseError::MissingColumn("z"))?;

        let width = [id, x, y, z, kind.unwrap_or(0)]
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            id,
            kind,
            axes: [x, y, z],
            width,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct BoxSection {
    bounds: [f64; 6],
    tilt: Option<[f64; 3]>,
    periodic: [bool; 3],
}

/// Returns the text after `ITEM:` if the line is a section header.
fn item_body(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("ITEM:").map(str::trim)
}

fn is_timestep_item(line: &str) -> bool {
    item_body(line).is_some_and(|body| body.starts_with("TIMESTEP"))
}

fn clip(line: &str) -> String {
    line.chars().take(80).collect()
}

/// Streaming frame reader over any buffered source.
pub struct DumpReader<R> {
    reader: R,
    line_no: usize,
    peeked: Option<String>,
    buf: String,
    done: bool,
    last_failure: Option<(Option<u64>, usize)>,
}

impl<R: BufRead> DumpReader<R> {
    /// Creates a reader over `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            peeked: None,
            buf: String::new(),
            done: false,
            last_failure: None,
        }
    }

    /// Timestep and start line of the frame behind the most recent error.
    pub fn last_failure(&self) -> Option<(Option<u64>, usize)> {
        self.last_failure
    }

    fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        self.buf.clear();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(self.buf.trim_end_matches(['\n', '\r']).to_string()))
    }

    fn push_back(&mut self, line: String) {
        self.peeked = Some(line);
    }

    fn next_non_blank(&mut self) -> std::io::Result<Option<String>> {
        loop {
            match self.next_line()? {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Consumes lines up to (not including) the next `ITEM: TIMESTEP`.
    fn skip_to_next_frame(&mut self) -> std::io::Result<()> {
        while let Some(line) = self.next_line()? {
            if is_timestep_item(&line) {
                self.push_back(line);
                break;
            }
        }
        Ok(())
    }

    /// Consumes the body of a section this reader does not interpret.
    fn skip_section_body(&mut self) -> std::io::Result<()> {
        while let Some(line) = self.next_line()? {
            if item_body(&line).is_some() {
                self.push_back(line);
                break;
            }
        }
        Ok(())
    }

    fn read_value<T: FromStr>(&mut self, section: &'static str) -> Result<T, ParseError> {
        let line = self
            .next_non_blank()?
            .ok_or(ParseError::MissingSection(section))?;
        let token = line.split_whitespace().next().unwrap_or_default();
        token.parse().map_err(|_| ParseError::InvalidHeader {
            line: self.line_no,
            reason: format!("expected a number after ITEM: {section}, found '{}'", clip(&line)),
        })
    }

    fn read_box(&mut self, header: &str) -> Result<BoxSection, ParseError> {
        let tokens: Vec<&str> = header.split_whitespace().collect();
        let triclinic = tokens.len() >= 3 && tokens[..3] == ["xy", "xz", "yz"];
        let flags = if triclinic { &tokens[3..] } else { &tokens[..] };

        let mut periodic = [true; 3];
        for (axis, flag) in periodic.iter_mut().enumerate() {
            *flag = flags.get(axis).map_or(true, |token| token.starts_with('p'));
        }

        let mut bounds = [0.0f64; 6];
        let mut tilt = [0.0f64; 3];
        let needed = if triclinic { 3 } else { 2 };

        for axis in 0..3 {
            let line = self
                .next_non_blank()?
                .ok_or(ParseError::MissingSection("BOX BOUNDS"))?;
            let values: Vec<f64> = line
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|_| ParseError::InvalidHeader {
                    line: self.line_no,
                    reason: format!("unreadable box bounds '{}'", clip(&line)),
                })?;
            if values.len() < needed {
                return Err(ParseError::InvalidHeader {
                    line: self.line_no,
                    reason: format!("expected {needed} box values, found {}", values.len()),
                });
            }
            bounds[axis * 2] = values[0];
            bounds[axis * 2 + 1] = values[1];
            if triclinic {
                tilt[axis] = values[2];
            }
        }

        Ok(BoxSection {
            bounds,
            tilt: triclinic.then_some(tilt),
            periodic,
        })
    }

    fn read_frame(
        &mut self,
        timestep_seen: &mut Option<u64>,
        start_line: &mut usize,
    ) -> Result<Option<TrajectoryFrame>, ParseError> {
        let Some(first) = self.next_non_blank()? else {
            return Ok(None);
        };
        *start_line = self.line_no;

        if !is_timestep_item(&first) {
            return Err(ParseError::InvalidHeader {
                line: self.line_no,
                reason: format!("expected 'ITEM: TIMESTEP', found '{}'", clip(&first)),
            });
        }

        let timestep: u64 = self.read_value("TIMESTEP")?;
        *timestep_seen = Some(timestep);

        let mut declared: Option<u64> = None;
        let mut box_section: Option<BoxSection> = None;

        let columns: Vec<String> = loop {
            let line = self
                .next_non_blank()?
                .ok_or(ParseError::MissingSection("ATOMS"))?;
            let Some(body) = item_body(&line) else {
                return Err(ParseError::InvalidHeader {
                    line: self.line_no,
                    reason: format!("unexpected line '{}'", clip(&line)),
                });
            };

            if body.starts_with("NUMBER OF ATOMS") {
                declared = Some(self.read_value("NUMBER OF ATOMS")?);
            } else if let Some(header) = body.strip_prefix("BOX BOUNDS") {
                let header = header.to_string();
                box_section = Some(self.read_box(&header)?);
            } else if let Some(header) = body.strip_prefix("ATOMS") {
                break header
                    .split_whitespace()
                    .map(str::to_ascii_lowercase)
                    .collect();
            } else if body.starts_with("TIMESTEP") {
                self.push_back(line);
                return Err(ParseError::MissingSection("ATOMS"));
            } else {
                self.skip_section_body()?;
            }
        };

        let declared = declared.ok_or(ParseError::MissingSection("NUMBER OF ATOMS"))?;
        let box_section = box_section.ok_or(ParseError::MissingSection("BOX BOUNDS"))?;
        let layout = ColumnLayout::resolve(&columns)?;

        let capacity = declared.min(MAX_PREALLOCATED_ATOMS) as usize;
        let mut ids = Vec::with_capacity(capacity);
        let mut types = Vec::with_capacity(capacity);
        let mut positions = Vec::with_capacity(capacity * 3);
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];

        while let Some(line) = self.next_line()? {
            let row = line.trim();
            if row.is_empty() {
                continue;
            }
            if row.starts_with("ITEM:") {
                self.push_back(line);
                break;
            }

            let fields: Vec<&str> = row.split_whitespace().collect();
            if fields.len() < layout.width {
                let missing = &columns[fields.len()];
                return Err(ParseError::InvalidValue {
                    line: self.line_no,
                    column: missing.clone(),
                    value: String::new(),
                });
            }

            ids.push(self.field::<u32>(&fields, &columns, layout.id)?);
            types.push(match layout.kind {
                Some(index) => self.field::<u16>(&fields, &columns, index)?,
                None => 1,
            });
            for (axis, &index) in layout.axes.iter().enumerate() {
                let value = self.field::<f32>(&fields, &columns, index)?;
                min[axis] = min[axis].min(value);
                max[axis] = max[axis].max(value);
                positions.push(value);
            }
        }

        let decoded = ids.len() as u64;
        if decoded != declared {
            return Err(ParseError::AtomCountMismatch { declared, decoded });
        }
        if decoded == 0 {
            min = [0.0; 3];
            max = [0.0; 3];
        }

        Ok(Some(TrajectoryFrame {
            timestep,
            atom_count: decoded,
            box_bounds: box_section.bounds,
            tilt: box_section.tilt,
            periodic: box_section.periodic,
            columns,
            ids,
            positions,
            types,
            min,
            max,
        }))
    }

    fn field<T: FromStr>(
        &self,
        fields: &[&str],
        columns: &[String],
        index: usize,
    ) -> Result<T, ParseError> {
        let raw = fields[index];
        raw.parse().map_err(|_| ParseError::InvalidValue {
            line: self.line_no,
            column: columns[index].clone(),
            value: raw.to_string(),
        })
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<TrajectoryFrame, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut timestep = None;
        let mut start_line = self.line_no + 1;

        match self.read_frame(&mut timestep, &mut start_line) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.last_failure = Some((timestep, start_line));
                if matches!(error, ParseError::Io(_)) {
                    self.done = true;
                } else if let Err(io) = self.skip_to_next_frame() {
                    debug!(error = %io, "Reader failed while resynchronising");
                    self.done = true;
                }
                Some(Err(error))
            }
        }
    }
}

/// Reads every frame of a dump, collecting successes and failures separately.
pub fn parse_dump<R: BufRead>(reader: R) -> ParseReport {
    let mut report = ParseReport::default();
    let mut frames = DumpReader::new(reader);

    while let Some(result) = frames.next() {
        match result {
            Ok(frame) => report.frames.push(frame),
            Err(error) => {
                let (timestep, start_line) = frames.last_failure().unwrap_or((None, 0));
                debug!(?timestep, start_line, error = %error, "Skipping malformed frame");
                report.failures.push(FrameFailure {
                    timestep,
                    start_line,
                    error,
                });
            }
        }
    }

    report
}

/// Reads the first frame of a single-frame dump.
pub fn parse_frame<R: BufRead>(reader: R) -> Result<TrajectoryFrame, ParseError> {
    DumpReader::new(reader)
        .next()
        .unwrap_or(Err(ParseError::MissingSection("TIMESTEP")))
}
