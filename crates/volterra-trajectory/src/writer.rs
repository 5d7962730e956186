//! Dump text serialisation.

use crate::frame::TrajectoryFrame;
use std::io::{self, Write};

/// Writes `frame` as a single-frame LAMMPS dump.
///
/// Atom rows carry `id type x y z`; other columns of the source dump are not
/// retained by [`TrajectoryFrame`] and are not written.
pub fn write_dump<W: Write>(frame: &TrajectoryFrame, mut out: W) -> io::Result<()> {
    let flag = |periodic: bool| if periodic { "pp" } else { "ff" };
    let flags = format!(
        "{} {} {}",
        flag(frame.periodic[0]),
        flag(frame.periodic[1]),
        flag(frame.periodic[2])
    );

    writeln!(out, "ITEM: TIMESTEP")?;
    writeln!(out, "{}", frame.timestep)?;
    writeln!(out, "ITEM: NUMBER OF ATOMS")?;
    writeln!(out, "{}", frame.ids.len())?;

    match frame.tilt {
        Some(tilt) => {
            writeln!(out, "ITEM: BOX BOUNDS xy xz yz {flags}")?;
            for axis in 0..3 {
                writeln!(
                    out,
                    "{} {} {}",
                    frame.box_bounds[axis * 2],
                    frame.box_bounds[axis * 2 + 1],
                    tilt[axis]
                )?;
            }
        }
        None => {
            writeln!(out, "ITEM: BOX BOUNDS {flags}")?;
            for axis in 0..3 {
                writeln!(
                    out,
                    "{} {}",
                    frame.box_bounds[axis * 2],
                    frame.box_bounds[axis * 2 + 1]
                )?;
            }
        }
    }

    writeln!(out, "ITEM: ATOMS id type x y z")?;
    let rows = frame
        .ids
        .iter()
        .zip(&frame.types)
        .zip(frame.positions.chunks_exact(3));
    for ((id, kind), p) in rows {
        writeln!(out, "{id} {kind} {} {} {}", p[0], p[1], p[2])?;
    }

    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_frame;
    use std::io::Cursor;

    #[test]
    fn test_written_dump_parses_back() {
        let text = "\
ITEM: TIMESTEP
42
ITEM: NUMBER OF ATOMS
2
ITEM: BOX BOUNDS xy xz yz pp ff pp
0 8 0.5
0 8 0
-1 7 0.25
ITEM: ATOMS id type x y z vx
3 2 1.25 2.5 -0.75 9.0
9 1 4 5 6 9.0
";
        let frame = parse_frame(Cursor::new(text)).unwrap();

        let mut out = Vec::new();
        write_dump(&frame, &mut out).unwrap();
        let reparsed = parse_frame(Cursor::new(out)).unwrap();

        assert_eq!(reparsed.timestep, 42);
        assert_eq!(reparsed.ids, frame.ids);
        assert_eq!(reparsed.types, frame.types);
        assert_eq!(reparsed.positions, frame.positions);
        assert_eq!(reparsed.box_bounds, frame.box_bounds);
        assert_eq!(reparsed.tilt, frame.tilt);
        assert_eq!(reparsed.periodic, [true, false, true]);
        assert_eq!(reparsed.columns, vec!["id", "type", "x", "y", "z"]);
    }
}
