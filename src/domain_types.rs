//! Validated domain primitives shared across the supervisor, model manager,
//! and registry.
//!
//! Every quantity that carries a domain invariant (a bounded memory size, a
//! port number, a restart budget, ...) is represented as a `nutype`-validated
//! newtype rather than a bare integer, so an out-of-range value is rejected
//! at the parse/construction boundary instead of surfacing as a silent bug
//! deep in the supervisor loop.

use nutype::nutype;
use std::time::Duration;
use uuid::Uuid;

/// Stable, unique identifier for an agent as declared in the topology.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Borrow)
)]
pub struct AgentName(String);

/// Identifier for a model known to the Model Manager.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Borrow)
)]
pub struct ModelId(String);

/// Opaque, globally unique identifier for a single request as it flows
/// through the Request Coordinator and Cross-Machine Router.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Mints a fresh request id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A TCP port number in the dynamic/user range.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65535),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct PortNumber(u16);

/// Reserved VRAM expressed in megabytes.
#[nutype(
    validate(less_or_equal = 1_048_576),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 0
)]
pub struct VramMb(u64);

impl VramMb {
    /// Saturating addition; the accountant never lets a sum overflow the
    /// representable range, it simply clamps at the maximum.
    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self::try_new(self.into_inner().saturating_add(other.into_inner()))
            .unwrap_or_else(|_| Self::try_new(1_048_576).expect("max is a valid VramMb"))
    }

    /// Saturating subtraction, floored at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self::try_new(self.into_inner().saturating_sub(other.into_inner()))
            .expect("difference of two valid VramMb values is always valid")
    }
}

/// Relative scheduling priority. Higher values are more important; the
/// accountant reserves `Priority::max()` as the "never evict" band.
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 10
)]
pub struct Priority(u8);

impl Priority {
    /// The reserved, non-evictable priority band.
    #[must_use]
    pub fn max() -> Self {
        Self::try_new(100).expect("100 is within bounds")
    }
}

/// A tie-breaker used when two agents are otherwise equally ready to start.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default
))]
pub struct StartupPriority(i32);

/// Count of restart attempts made for a single agent since it last reached
/// `Ready`.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default
))]
pub struct RestartCount(u32);

impl RestartCount {
    /// Returns the next count, saturating rather than overflowing.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }
}

/// A duration expressed in whole seconds, used for probe intervals, grace
/// windows, and breaker timers.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct Seconds(u64);

impl Seconds {
    /// Converts to a `std::time::Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// A count of consecutive probe failures or successes.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default
))]
pub struct ConsecutiveCount(u32);

impl ConsecutiveCount {
    /// Increments by one.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }
}

/// Which physical machine an agent is pinned to, or whether either may run
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAffinity {
    /// Must run on the GPU-bearing primary machine.
    Primary,
    /// Must run on the secondary worker machine.
    Secondary,
    /// May run on either; first supervisor to register it wins.
    Any,
}

/// Identity of a physical node in the two-machine deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// The GPU-bearing primary machine.
    Primary,
    /// The secondary worker machine.
    Secondary,
}
