//! Pass timing.
//!
//! A pass holds the guard returned by `timing::start` while it runs. Durations accumulate per
//! thread until collected with `take_current`.

use core::fmt;
use std::cell::RefCell;
use std::time::{Duration, Instant};

/// A timed allocator pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Input and output verification.
    Verifier,
    /// Control flow graph.
    Flowgraph,
    /// Dominator tree.
    Domtree,
    /// Loop analysis.
    LoopAnalysis,
    /// Block frequency estimation.
    BlockFrequency,
    /// The whole allocation of one function.
    Regalloc,
    /// Program point numbering.
    SlotIndexes,
    /// Live interval analysis.
    LiveIntervals,
    /// Spill weight calculation.
    SpillWeights,
    /// The allocator's queue loop.
    Assign,
    /// Interference eviction.
    Eviction,
    /// Live range splitting.
    Split,
    /// Inline spilling.
    Spill,
    /// Spill hoisting.
    HoistSpills,
    /// Virtual register rewriting.
    Rewrite,
}

const NUM_PASSES: usize = Pass::Rewrite as usize + 1;

impl Pass {
    fn description(self) -> &'static str {
        match self {
            Self::Verifier => "Verify function",
            Self::Flowgraph => "Control flow graph",
            Self::Domtree => "Dominator tree",
            Self::LoopAnalysis => "Loop analysis",
            Self::BlockFrequency => "Block frequency estimation",
            Self::Regalloc => "Register allocation",
            Self::SlotIndexes => "Program point numbering",
            Self::LiveIntervals => "Live interval analysis",
            Self::SpillWeights => "Spill weight calculation",
            Self::Assign => "Register assignment",
            Self::Eviction => "Interference eviction",
            Self::Split => "Live range splitting",
            Self::Spill => "Inline spilling",
            Self::HoistSpills => "Spill hoisting",
            Self::Rewrite => "Virtual register rewriting",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Accumulated time and run count per pass. Nested passes are included in their parent.
#[derive(Clone, Debug, Default)]
pub struct PassTimes {
    pass: [(Duration, u32); NUM_PASSES],
}

impl PassTimes {
    /// How many times `pass` was started.
    pub fn runs(&self, pass: Pass) -> u32 {
        self.pass[pass as usize].1
    }

    /// The time spent in `pass`.
    pub fn time(&self, pass: Pass) -> Duration {
        self.pass[pass as usize].0
    }
}

impl fmt::Display for PassTimes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const ALL: [Pass; NUM_PASSES] = [
            Pass::Verifier,
            Pass::Flowgraph,
            Pass::Domtree,
            Pass::LoopAnalysis,
            Pass::BlockFrequency,
            Pass::Regalloc,
            Pass::SlotIndexes,
            Pass::LiveIntervals,
            Pass::SpillWeights,
            Pass::Assign,
            Pass::Eviction,
            Pass::Split,
            Pass::Spill,
            Pass::HoistSpills,
            Pass::Rewrite,
        ];
        writeln!(f, "   Total   Runs Pass")?;
        for pass in ALL {
            let (time, runs) = self.pass[pass as usize];
            if runs == 0 {
                continue;
            }
            writeln!(f, "{:8.3} {runs:6} {pass}", time.as_secs_f64() * 1000.0)?;
        }
        Ok(())
    }
}

thread_local! {
    static PASS_TIME: RefCell<PassTimes> = RefCell::new(PassTimes::default());
}

/// Times a pass from `start` until dropped.
#[must_use]
pub struct PassGuard {
    pass: Pass,
    start: Instant,
}

/// Start timing `pass`.
pub fn start(pass: Pass) -> PassGuard {
    log::trace!("timing: Starting {pass}");
    PassGuard {
        pass,
        start: Instant::now(),
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::trace!("timing: Ending {}", self.pass);
        PASS_TIME.with(|rc| {
            let entry = &mut rc.borrow_mut().pass[self.pass as usize];
            entry.0 += elapsed;
            entry.1 += 1;
        });
    }
}

/// Take the pass timings of the current thread, resetting them.
pub fn take_current() -> PassTimes {
    PASS_TIME.with(|rc| rc.take())
}
