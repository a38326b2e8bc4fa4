//! Opaque logger sinks for forest activity.
//!
//! A [`ForestLogger`] receives phase boundaries (GC, saturation,
//! reordering) and per-level active-node deltas. [`LineLogger`] writes
//! them as a line-oriented, human-readable stream with a self-describing
//! preamble; the exact bytes are not a stability contract, only the
//! line structure announced by the preamble.

use std::io::Write;

use crate::types::Level;

/// Sink for forest lifecycle events.
pub trait ForestLogger {
    /// Called once when the logger is attached, with the current
    /// active-node count per unprimed level (bottom up).
    fn forest_info(&mut self, num_vars: usize, counts: &[i64]) {
        let _ = (num_vars, counts);
    }

    /// A long-running phase begins.
    fn phase_begin(&mut self, phase: &str) {
        let _ = phase;
    }

    /// A long-running phase ends.
    fn phase_end(&mut self, phase: &str) {
        let _ = phase;
    }

    /// The number of active nodes at `level` changed by `delta`.
    fn active_delta(&mut self, level: Level, delta: i64) {
        let _ = (level, delta);
    }
}

/// A line-oriented logger.
///
/// The first event writes a preamble describing the line formats:
///
/// ```text
/// # mdd-rs forest log
/// # F <num-vars> <count per level, bottom up>
/// # B <phase>  /  E <phase>
/// # a <level> <delta>
/// ```
pub struct LineLogger<W: Write> {
    out: W,
    wrote_preamble: bool,
}

impl<W: Write> LineLogger<W> {
    pub fn new(out: W) -> Self {
        LineLogger {
            out,
            wrote_preamble: false,
        }
    }

    fn preamble(&mut self) {
        if !self.wrote_preamble {
            self.wrote_preamble = true;
            let _ = writeln!(self.out, "# mdd-rs forest log");
            let _ = writeln!(self.out, "# F <num-vars> <counts bottom-up>");
            let _ = writeln!(self.out, "# B <phase> / E <phase>");
            let _ = writeln!(self.out, "# a <level> <delta>");
        }
    }
}

impl<W: Write> ForestLogger for LineLogger<W> {
    fn forest_info(&mut self, num_vars: usize, counts: &[i64]) {
        self.preamble();
        let _ = write!(self.out, "F {}", num_vars);
        for c in counts {
            let _ = write!(self.out, " {}", c);
        }
        let _ = writeln!(self.out);
    }

    fn phase_begin(&mut self, phase: &str) {
        self.preamble();
        let _ = writeln!(self.out, "B {}", phase);
    }

    fn phase_end(&mut self, phase: &str) {
        self.preamble();
        let _ = writeln!(self.out, "E {}", phase);
    }

    fn active_delta(&mut self, level: Level, delta: i64) {
        self.preamble();
        let _ = writeln!(self.out, "a {} {}", level.raw(), delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_logger_preamble_once() {
        let mut buf = Vec::new();
        {
            let mut lg = LineLogger::new(&mut buf);
            lg.phase_begin("gc");
            lg.active_delta(Level::unprimed(2), 1);
            lg.phase_end("gc");
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches("# mdd-rs forest log").count(), 1);
        assert!(text.contains("B gc"));
        assert!(text.contains("a 2 1"));
        assert!(text.contains("E gc"));
    }
}
