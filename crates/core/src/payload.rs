//! Task payloads and the capability every payload exposes.
//!
//! A payload is the part of a task that travels to a worker process. Each
//! kind is its own type implementing [`Execute`]; [`Payload`] is the tagged
//! union the scheduler stores and ships over the wire.
//!
//! The bundled filters are CPU-bound placeholders. They are deterministic so
//! that running one remotely yields exactly what running it in-process does.

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};

/// Largest angle (in degrees) a filter may sweep.
pub const MAX_ANGLE_DEG: u32 = 90;

const DEFAULT_ITERATIONS: u64 = 2_000_000;
const DEFAULT_MAX_ANGLE_DEG: u32 = 45;

/// Execute the payload and produce a result, or fail.
pub trait Execute: Send + Sync {
    /// Short stable name of the payload kind (used in logs and outputs).
    fn label(&self) -> &str;

    fn execute(&self) -> Result<TaskOutput>;
}

/// Value produced by a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub label: String,
    pub value: f64,
}

impl std::fmt::Display for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, result: {:.2}", self.label, self.value)
    }
}

fn default_iterations() -> u64 {
    DEFAULT_ITERATIONS
}

fn default_max_angle() -> u32 {
    DEFAULT_MAX_ANGLE_DEG
}

fn validate(label: &str, iterations: u64, max_angle_deg: u32) -> Result<()> {
    if iterations == 0 {
        return Err(DroverError::Execution(format!(
            "{label}: iterations must be positive"
        )));
    }
    if max_angle_deg > MAX_ANGLE_DEG {
        return Err(DroverError::Execution(format!(
            "{label}: max_angle_deg {max_angle_deg} exceeds {MAX_ANGLE_DEG}"
        )));
    }
    Ok(())
}

/// Deterministic walk over `0..=max_angle_deg`, in radians.
fn angles(iterations: u64, max_angle_deg: u32) -> impl Iterator<Item = f64> {
    let span = u64::from(max_angle_deg) + 1;
    (0..iterations).map(move |i| ((i.wrapping_mul(7) % span) as f64).to_radians())
}

// ── Filters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XmlFilter {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_max_angle")]
    pub max_angle_deg: u32,
}

impl XmlFilter {
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            max_angle_deg: DEFAULT_MAX_ANGLE_DEG,
        }
    }
}

impl Default for XmlFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

impl Execute for XmlFilter {
    fn label(&self) -> &str {
        "xml_filter"
    }

    fn execute(&self) -> Result<TaskOutput> {
        validate(self.label(), self.iterations, self.max_angle_deg)?;
        let value = angles(self.iterations, self.max_angle_deg)
            .map(|a| a.tanh() / a.cosh())
            .sum();
        Ok(TaskOutput {
            label: self.label().to_string(),
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XslFilter {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_max_angle")]
    pub max_angle_deg: u32,
}

impl XslFilter {
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            max_angle_deg: DEFAULT_MAX_ANGLE_DEG,
        }
    }
}

impl Default for XslFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

impl Execute for XslFilter {
    fn label(&self) -> &str {
        "xsl_filter"
    }

    fn execute(&self) -> Result<TaskOutput> {
        validate(self.label(), self.iterations, self.max_angle_deg)?;
        let value = angles(self.iterations, self.max_angle_deg)
            .map(|a| a.sin() * a.cos())
            .sum();
        Ok(TaskOutput {
            label: self.label().to_string(),
            value,
        })
    }
}

// ── Payload ──────────────────────────────────────────────────────────

/// Every payload kind a worker knows how to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    XmlFilter(XmlFilter),
    XslFilter(XslFilter),
}

impl Payload {
    fn inner(&self) -> &dyn Execute {
        match self {
            Payload::XmlFilter(f) => f,
            Payload::XslFilter(f) => f,
        }
    }
}

impl Execute for Payload {
    fn label(&self) -> &str {
        self.inner().label()
    }

    fn execute(&self) -> Result<TaskOutput> {
        self.inner().execute()
    }
}

impl From<XmlFilter> for Payload {
    fn from(f: XmlFilter) -> Self {
        Payload::XmlFilter(f)
    }
}

impl From<XslFilter> for Payload {
    fn from(f: XslFilter) -> Self {
        Payload::XslFilter(f)
    }
}
