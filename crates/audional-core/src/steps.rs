//! Step grids and their compact persisted form
//!
//! During playback a channel's steps are a plain boolean array. On disk the
//! lit steps are stored compactly: contiguous runs become `{"r":[start,end]}`,
//! isolated steps are bare indices and reversed steps are written as `"12r"`.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Number of steps in a sequence unless a project says otherwise
pub const DEFAULT_STEP_COUNT: usize = 64;

/// Largest grid a project may hold
pub const MAX_STEP_COUNT: usize = 4096;

/// A lit step as it appears in the compact form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepRef {
    pub index: usize,
    pub reversed: bool,
}

impl StepRef {
    pub fn new(index: usize) -> Self {
        Self { index, reversed: false }
    }

    pub fn reversed(index: usize) -> Self {
        Self { index, reversed: true }
    }
}

/// Reversed step marker, serialized as `"<index>r"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReversedStep(pub usize);

impl Serialize for ReversedStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}r", self.0))
    }
}

impl<'de> Deserialize<'de> for ReversedStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ReversedVisitor;

        impl Visitor<'_> for ReversedVisitor {
            type Value = ReversedStep;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a step index with an `r` suffix")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ReversedStep, E> {
                value
                    .strip_suffix('r')
                    .and_then(|digits| digits.parse().ok())
                    .map(ReversedStep)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(ReversedVisitor)
    }
}

/// One entry of the compact step encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompactStep {
    Single(usize),
    Range { r: [usize; 2] },
    Reversed(ReversedStep),
}

/// Compress sorted step references into runs, singletons and reversed markers.
pub fn compress(steps: &[StepRef]) -> Vec<CompactStep> {
    fn flush(out: &mut Vec<CompactStep>, run: Option<(usize, usize)>) {
        match run {
            Some((start, end)) if end > start => out.push(CompactStep::Range { r: [start, end] }),
            Some((start, _)) => out.push(CompactStep::Single(start)),
            None => {}
        }
    }

    let mut out = Vec::new();
    let mut run: Option<(usize, usize)> = None;

    for step in steps {
        if step.reversed {
            flush(&mut out, run.take());
            out.push(CompactStep::Reversed(ReversedStep(step.index)));
            continue;
        }
        run = match run {
            Some((start, end)) if step.index == end + 1 => Some((start, step.index)),
            other => {
                flush(&mut out, other);
                Some((step.index, step.index))
            }
        };
    }
    flush(&mut out, run);
    out
}

/// Expand a compact encoding back into step references.
///
/// Inverted ranges expand to nothing.
pub fn decompress(compact: &[CompactStep]) -> Vec<StepRef> {
    let mut out = Vec::new();
    for entry in compact {
        match *entry {
            CompactStep::Single(index) => out.push(StepRef::new(index)),
            CompactStep::Range { r: [start, end] } => {
                out.extend((start..=end).map(StepRef::new));
            }
            CompactStep::Reversed(ReversedStep(index)) => out.push(StepRef::reversed(index)),
        }
    }
    out
}

/// Lit indices of a boolean step array
pub fn steps_to_refs(steps: &[bool]) -> Vec<StepRef> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, lit)| **lit)
        .map(|(index, _)| StepRef::new(index))
        .collect()
}

/// Expand a compact encoding, keeping only indices below `len`. Ranges are
/// cut at the grid end before they are expanded.
pub fn decompress_within(compact: &[CompactStep], len: usize) -> Vec<StepRef> {
    let Some(last) = len.checked_sub(1) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in compact {
        match *entry {
            CompactStep::Single(index) if index < len => out.push(StepRef::new(index)),
            CompactStep::Range { r: [start, end] } if start < len => {
                out.extend((start..=end.min(last)).map(StepRef::new));
            }
            CompactStep::Reversed(ReversedStep(index)) if index < len => {
                out.push(StepRef::reversed(index))
            }
            _ => {}
        }
    }
    out
}

/// Boolean step array of `len` steps with every referenced index lit.
/// Indices outside the grid are dropped.
pub fn refs_to_steps(refs: &[StepRef], len: usize) -> Vec<bool> {
    let mut steps = vec![false; len];
    for step in refs {
        if let Some(cell) = steps.get_mut(step.index) {
            *cell = true;
        }
    }
    steps
}

/// Live step grid of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGrid {
    lit: Vec<bool>,
    reversed: BTreeSet<usize>,
}

impl Default for StepGrid {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_COUNT)
    }
}

impl StepGrid {
    pub fn new(len: usize) -> Self {
        Self {
            lit: vec![false; len],
            reversed: BTreeSet::new(),
        }
    }

    pub fn from_bools(steps: Vec<bool>) -> Self {
        Self { lit: steps, reversed: BTreeSet::new() }
    }

    pub fn from_refs(refs: &[StepRef], len: usize) -> Self {
        let reversed = refs
            .iter()
            .filter(|s| s.reversed && s.index < len)
            .map(|s| s.index)
            .collect();
        Self {
            lit: refs_to_steps(refs, len),
            reversed,
        }
    }

    pub fn len(&self) -> usize {
        self.lit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lit.is_empty()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.lit
    }

    pub fn is_lit(&self, step: usize) -> bool {
        self.lit.get(step).copied().unwrap_or(false)
    }

    pub fn is_reversed(&self, step: usize) -> bool {
        self.is_lit(step) && self.reversed.contains(&step)
    }

    pub fn set(&mut self, step: usize, lit: bool) {
        if let Some(cell) = self.lit.get_mut(step) {
            *cell = lit;
            if !lit {
                self.reversed.remove(&step);
            }
        }
    }

    pub fn toggle(&mut self, step: usize) {
        let current = self.is_lit(step);
        self.set(step, !current);
    }

    /// Mark a lit step to play its sample backwards
    pub fn set_reversed(&mut self, step: usize, reversed: bool) {
        if !self.is_lit(step) {
            return;
        }
        if reversed {
            self.reversed.insert(step);
        } else {
            self.reversed.remove(&step);
        }
    }

    pub fn clear(&mut self) {
        self.lit.fill(false);
        self.reversed.clear();
    }

    /// Grow or truncate to `len` steps
    pub fn resize(&mut self, len: usize) {
        self.lit.resize(len, false);
        self.reversed.retain(|&s| s < len);
    }

    pub fn lit_count(&self) -> usize {
        self.lit.iter().filter(|lit| **lit).count()
    }

    pub fn to_refs(&self) -> Vec<StepRef> {
        steps_to_refs(&self.lit)
            .into_iter()
            .map(|s| StepRef {
                reversed: self.reversed.contains(&s.index),
                ..s
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct StepGridRepr {
    len: usize,
    on: Vec<CompactStep>,
}

impl Serialize for StepGrid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StepGridRepr {
            len: self.len(),
            on: compress(&self.to_refs()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StepGrid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = StepGridRepr::deserialize(deserializer)?;
        if repr.len > MAX_STEP_COUNT {
            return Err(de::Error::custom(format!(
                "grid of {} steps exceeds the limit of {MAX_STEP_COUNT}",
                repr.len
            )));
        }
        Ok(StepGrid::from_refs(&decompress_within(&repr.on, repr.len), repr.len))
    }
}
