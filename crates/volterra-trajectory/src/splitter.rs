//! Cuts a multi-frame dump into raw per-frame text blocks.
//!
//! The splitter only looks at the header lines it needs to name a frame
//! (timestep and declared atom count); atom rows are copied through verbatim
//! and decoded later by the chunk worker.

use std::io::BufRead;

/// One `ITEM: TIMESTEP` block, undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Timestep, when the line after `ITEM: TIMESTEP` is a number.
    pub timestep: Option<u64>,

    /// Declared atom count, when present and numeric.
    pub atom_count: Option<u64>,

    /// Line number of the block's `ITEM: TIMESTEP` line.
    pub start_line: usize,

    /// The block's text, newline-terminated.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Nothing,
    Timestep,
    AtomCount,
}

/// Iterator over raw frame blocks.
///
/// Text before the first `ITEM: TIMESTEP` is discarded.
pub struct RawFrameSplitter<R> {
    reader: R,
    line_no: usize,
    carry: Option<(usize, String)>,
    done: bool,
}

impl<R: BufRead> RawFrameSplitter<R> {
    /// Creates a splitter over `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            carry: None,
            done: false,
        }
    }

    fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if !line.ends_with('\n') {
            line.push('\n');
        }
        Ok(Some(line))
    }

    fn is_frame_start(line: &str) -> bool {
        line.trim_start()
            .strip_prefix("ITEM:")
            .is_some_and(|rest| rest.trim_start().starts_with("TIMESTEP"))
    }

    fn next_block(&mut self) -> std::io::Result<Option<RawFrame>> {
        let (start_line, first) = match self.carry.take() {
            Some(carried) => carried,
            None => loop {
                match self.read_line()? {
                    Some(line) if Self::is_frame_start(&line) => break (self.line_no, line),
                    Some(_) => continue,
                    None => return Ok(None),
                }
            },
        };

        let mut frame = RawFrame {
            timestep: None,
            atom_count: None,
            start_line,
            text: first,
        };
        let mut expect = Expect::Timestep;

        while let Some(line) = self.read_line()? {
            if Self::is_frame_start(&line) {
                self.carry = Some((self.line_no, line));
                break;
            }

            let trimmed = line.trim();
            match expect {
                Expect::Timestep if !trimmed.is_empty() => {
                    frame.timestep = trimmed.parse().ok();
                    expect = Expect::Nothing;
                }
                Expect::AtomCount if !trimmed.is_empty() => {
                    frame.atom_count = trimmed.parse().ok();
                    expect = Expect::Nothing;
                }
                _ => {}
            }
            if trimmed.starts_with("ITEM:") && trimmed.contains("NUMBER OF ATOMS") {
                expect = Expect::AtomCount;
            }

            frame.text.push_str(&line);
        }

        Ok(Some(frame))
    }
}

impl<R: BufRead> Iterator for RawFrameSplitter<R> {
    type Item = std::io::Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
