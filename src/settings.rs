//! Shared allocator settings.
//!
//! Settings are configured with a `Builder` and frozen into a `Flags` object that the allocator
//! reads. Values are set by name from strings so they can come straight from a command line:
//!
//! ```ignore
//! let mut b = settings::builder();
//! b.set("split_spill_mode", "speed")?;
//! b.enable("enable_deferred_spilling")?;
//! let flags = settings::Flags::new(b);
//! ```

use core::fmt;
use core::str::FromStr;
use thiserror::Error;

/// An error produced when changing a setting.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetError {
    /// No setting by this name exists.
    #[error("No existing setting named '{0}'")]
    BadName(String),

    /// Type mismatch for setting (e.g., setting an enum setting as a bool).
    #[error("Trying to set a setting with the wrong type")]
    BadType,

    /// This is not a valid value for this setting.
    #[error("Unexpected value for a setting, expected {0}")]
    BadValue(String),
}

/// A result returned when changing a setting.
pub type SetResult<T> = Result<T, SetError>;

/// Implemented by objects that have named settings.
pub trait Configurable {
    /// Set the string value of any setting by name.
    ///
    /// This can set any type of setting whether it is numeric, boolean, or enumerated.
    fn set(&mut self, name: &str, value: &str) -> SetResult<()>;

    /// Enable a boolean setting or apply a preset.
    ///
    /// If the identified setting isn't a boolean or a preset, a `BadType` error is returned.
    fn enable(&mut self, name: &str) -> SetResult<()>;
}

/// How the residual part of a split live range relates to the split-off pieces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SplitSpillMode {
    /// The complement interval never overlaps the new intervals. This produces the most copies
    /// but keeps every interval minimal.
    Partition,
    /// The complement may overlap the new intervals so back-copies can be removed. Remaining
    /// back-copies are hoisted to a common dominator.
    Size,
    /// Like `Size`, but back-copies are only hoisted when that doesn't move them to a hotter
    /// block.
    Speed,
}

impl fmt::Display for SplitSpillMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::Partition => "partition",
            Self::Size => "size",
            Self::Speed => "speed",
        })
    }
}

impl FromStr for SplitSpillMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partition" => Ok(Self::Partition),
            "size" => Ok(Self::Size),
            "speed" => Ok(Self::Speed),
            _ => Err(()),
        }
    }
}

/// Which allocator assigns the registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegallocAlgorithm {
    /// Eviction, live range splitting and spilling, driven by a size ordered queue.
    Greedy,
    /// Spill weight ordered assignment that spills lighter interference, and never splits.
    Basic,
}

impl fmt::Display for RegallocAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::Greedy => "greedy",
            Self::Basic => "basic",
        })
    }
}

impl FromStr for RegallocAlgorithm {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(Self::Greedy),
            "basic" => Ok(Self::Basic),
            _ => Err(()),
        }
    }
}

/// Collect settings before freezing them into `Flags`.
#[derive(Clone)]
pub struct Builder {
    flags: Flags,
}

/// Create a new builder with all settings at their default values.
pub fn builder() -> Builder {
    Builder {
        flags: Flags::default(),
    }
}

fn parse_bool(value: &str) -> SetResult<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(SetError::BadValue("bool".to_string())),
    }
}

fn parse_num<T: FromStr>(value: &str) -> SetResult<T> {
    value
        .parse()
        .map_err(|_| SetError::BadValue("number".to_string()))
}

impl Configurable for Builder {
    fn set(&mut self, name: &str, value: &str) -> SetResult<()> {
        let f = &mut self.flags;
        match name {
            "enable_verifier" => f.enable_verifier = parse_bool(value)?,
            "regalloc_algorithm" => {
                f.regalloc_algorithm = value
                    .parse()
                    .map_err(|()| SetError::BadValue("greedy or basic".to_string()))?
            }
            "enable_deferred_spilling" => f.enable_deferred_spilling = parse_bool(value)?,
            "enable_local_reassign" => f.enable_local_reassign = parse_bool(value)?,
            "enable_last_chance_recoloring" => {
                f.enable_last_chance_recoloring = parse_bool(value)?
            }
            "exhaustive_search" => f.exhaustive_search = parse_bool(value)?,
            "hoist_spills" => f.hoist_spills = parse_bool(value)?,
            "split_spill_mode" => {
                f.split_spill_mode = value
                    .parse()
                    .map_err(|()| SetError::BadValue("partition, size or speed".to_string()))?
            }
            "lcr_max_depth" => f.lcr_max_depth = parse_num(value)?,
            "lcr_max_interf" => f.lcr_max_interf = parse_num(value)?,
            "csr_first_time_cost" => f.csr_first_time_cost = parse_num(value)?,
            "huge_size_for_split" => f.huge_size_for_split = parse_num(value)?,
            _ => return Err(SetError::BadName(name.to_string())),
        }
        Ok(())
    }

    fn enable(&mut self, name: &str) -> SetResult<()> {
        match name {
            "enable_verifier"
            | "enable_deferred_spilling"
            | "enable_local_reassign"
            | "enable_last_chance_recoloring"
            | "exhaustive_search"
            | "hoist_spills" => self.set(name, "true"),
            "regalloc_algorithm" | "split_spill_mode" | "lcr_max_depth" | "lcr_max_interf"
            | "csr_first_time_cost" | "huge_size_for_split" => Err(SetError::BadType),
            _ => Err(SetError::BadName(name.to_string())),
        }
    }
}

/// Frozen allocator settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flags {
    enable_verifier: bool,
    regalloc_algorithm: RegallocAlgorithm,
    enable_deferred_spilling: bool,
    enable_local_reassign: bool,
    enable_last_chance_recoloring: bool,
    exhaustive_search: bool,
    hoist_spills: bool,
    split_spill_mode: SplitSpillMode,
    lcr_max_depth: u32,
    lcr_max_interf: u32,
    csr_first_time_cost: u32,
    huge_size_for_split: u32,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            enable_verifier: true,
            regalloc_algorithm: RegallocAlgorithm::Greedy,
            enable_deferred_spilling: false,
            enable_local_reassign: false,
            enable_last_chance_recoloring: true,
            exhaustive_search: false,
            hoist_spills: true,
            split_spill_mode: SplitSpillMode::Partition,
            lcr_max_depth: 5,
            lcr_max_interf: 8,
            csr_first_time_cost: 0,
            huge_size_for_split: 5000,
        }
    }
}

impl Flags {
    /// Freeze the settings collected by `builder`.
    pub fn new(builder: Builder) -> Self {
        builder.flags
    }

    /// Verify the input function before allocating and the result after rewriting.
    pub fn enable_verifier(&self) -> bool {
        self.enable_verifier
    }

    /// The allocator to run.
    pub fn regalloc_algorithm(&self) -> RegallocAlgorithm {
        self.regalloc_algorithm
    }

    /// Mark registers for spilling and spill them in a final pass instead of immediately.
    pub fn enable_deferred_spilling(&self) -> bool {
        self.enable_deferred_spilling
    }

    /// Let eviction of local intervals consider moving the evictee to another free register.
    pub fn enable_local_reassign(&self) -> bool {
        self.enable_local_reassign
    }

    /// Try recoloring interfering registers before giving up on an unsplittable register.
    pub fn enable_last_chance_recoloring(&self) -> bool {
        self.enable_last_chance_recoloring
    }

    /// Ignore the last-chance recoloring cutoffs.
    pub fn exhaustive_search(&self) -> bool {
        self.exhaustive_search
    }

    /// Merge and hoist equal-valued spill stores after allocation.
    pub fn hoist_spills(&self) -> bool {
        self.hoist_spills
    }

    /// Complement handling used by the live range splitter.
    pub fn split_spill_mode(&self) -> SplitSpillMode {
        self.split_spill_mode
    }

    /// Maximum recursion depth of last-chance recoloring.
    pub fn lcr_max_depth(&self) -> u32 {
        self.lcr_max_depth
    }

    /// Maximum number of interfering registers last-chance recoloring will consider.
    pub fn lcr_max_interf(&self) -> u32 {
        self.lcr_max_interf
    }

    /// Cost, in block frequency units, of using a callee-saved register for the first time.
    pub fn csr_first_time_cost(&self) -> u32 {
        self.csr_first_time_cost
    }

    /// Number of live blocks above which region splitting becomes too expensive to try.
    pub fn huge_size_for_split(&self) -> u32 {
        self.huge_size_for_split
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[regalloc]")?;
        writeln!(f, "enable_verifier = {}", self.enable_verifier)?;
        writeln!(f, "regalloc_algorithm = \"{}\"", self.regalloc_algorithm)?;
        writeln!(f, "enable_deferred_spilling = {}", self.enable_deferred_spilling)?;
        writeln!(f, "enable_local_reassign = {}", self.enable_local_reassign)?;
        writeln!(
            f,
            "enable_last_chance_recoloring = {}",
            self.enable_last_chance_recoloring
        )?;
        writeln!(f, "exhaustive_search = {}", self.exhaustive_search)?;
        writeln!(f, "hoist_spills = {}", self.hoist_spills)?;
        writeln!(f, "split_spill_mode = \"{}\"", self.split_spill_mode)?;
        writeln!(f, "lcr_max_depth = {}", self.lcr_max_depth)?;
        writeln!(f, "lcr_max_interf = {}", self.lcr_max_interf)?;
        writeln!(f, "csr_first_time_cost = {}", self.csr_first_time_cost)?;
        writeln!(f, "huge_size_for_split = {}", self.huge_size_for_split)
    }
}
