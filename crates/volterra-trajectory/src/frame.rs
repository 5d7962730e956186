//! Decoded frame types.

use serde::{Deserialize, Serialize};

/// Header summary of one frame, known before its atoms are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    /// Simulation timestep.
    pub timestep: u64,

    /// Atom count declared by the header.
    pub atom_count: u64,
}

/// One decoded timestep of a trajectory.
///
/// Positions are packed `[x0, y0, z0, x1, y1, z1, ...]`; `ids` and `types`
/// are indexed by atom row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryFrame {
    /// Simulation timestep.
    pub timestep: u64,

    /// Number of atoms decoded.
    pub atom_count: u64,

    /// Box bounds as written: xlo, xhi, ylo, yhi, zlo, zhi.
    pub box_bounds: [f64; 6],

    /// Triclinic tilt factors (xy, xz, yz).
    pub tilt: Option<[f64; 3]>,

    /// Periodic boundary flags per axis.
    pub periodic: [bool; 3],

    /// Lower-cased `ITEM: ATOMS` column names.
    pub columns: Vec<String>,

    /// Atom ids.
    pub ids: Vec<u32>,

    /// Packed positions.
    pub positions: Vec<f32>,

    /// Atom type ids.
    pub types: Vec<u16>,

    /// Minimum position per axis.
    pub min: [f32; 3],

    /// Maximum position per axis.
    pub max: [f32; 3],
}

impl TrajectoryFrame {
    /// Returns the header summary for this frame.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            timestep: self.timestep,
            atom_count: self.atom_count,
        }
    }

    /// Returns the position of the atom at `row`.
    pub fn position(&self, row: usize) -> Option<[f32; 3]> {
        let base = row.checked_mul(3)?;
        let slice = self.positions.get(base..base + 3)?;
        Some([slice[0], slice[1], slice[2]])
    }

    /// Size of the position bounding box per axis.
    pub fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Returns true if the box carries tilt factors.
    pub fn is_triclinic(&self) -> bool {
        self.tilt.is_some()
    }
}
