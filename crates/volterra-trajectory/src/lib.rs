//! Volterra Trajectory - frame decoding and storage
//!
//! Everything that touches raw trajectory bytes lives here:
//! - [`parser`]: streaming LAMMPS dump reader producing [`TrajectoryFrame`]s
//! - [`splitter`]: cuts a multi-frame upload into per-frame raw text blocks
//! - [`writer`]: serialises a frame back to dump text (plugin input files)
//! - [`codec`]: the per-frame binary record
//! - [`store`]: persistence of binary records keyed by (trajectory, timestep)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::io::BufReader;
//! use volterra_trajectory::parse_dump;
//!
//! let file = std::fs::File::open("run.dump")?;
//! let report = parse_dump(BufReader::new(file));
//! for failure in &report.failures {
//!     eprintln!("skipped: {failure}");
//! }
//! println!("{} frames decoded", report.frames.len());
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod parser;
pub mod splitter;
pub mod store;
pub mod writer;

pub use codec::{decode_frame, encode_frame};
pub use error::{TrajectoryError, TrajectoryResult};
pub use frame::{FrameInfo, TrajectoryFrame};
pub use parser::{parse_dump, parse_frame, DumpReader, FrameFailure, ParseError, ParseReport};
pub use splitter::{RawFrame, RawFrameSplitter};
pub use store::{FrameStore, FsFrameStore, MemoryFrameStore, PutOutcome};
pub use writer::write_dump;
