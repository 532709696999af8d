//! VRAM Accountant (C7): tracks reserved VRAM per loaded model against a
//! fixed budget and selects deterministic eviction victims when admission
//! would exceed it — a running total plus a per-key map, with victim
//! selection instead of unconditional rejection once the budget is full.

use std::collections::HashMap;
use thiserror::Error;

use crate::domain_types::{ModelId, Priority, VramMb};

/// Errors raised by the accountant. Exceeding the budget is not modeled as
/// an error: callers ask [`VramAccountant::can_admit`] first and branch on
/// the result, so `reserve` only fails on a caller-side contract violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VramError {
    /// `reserve` was called for a model that already holds a reservation.
    #[error("model {0} already holds a VRAM reservation")]
    AlreadyReserved(String),

    /// `release` was called for a model with no active reservation.
    #[error("model {0} has no VRAM reservation to release")]
    NotReserved(String),

    /// The sum of individual reservations no longer agrees with the running
    /// total; the accountant has entered `Paused` until [`VramAccountant::reconcile`]
    /// clears it.
    #[error("vram accounting is inconsistent: recorded total {recorded} mb, recomputed {recomputed} mb")]
    Inconsistent {
        /// The running total before reconciliation was attempted.
        recorded: u64,
        /// The sum of all individual reservations.
        recomputed: u64,
    },
}

/// Outcome of [`VramAccountant::can_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The requested amount fits within the remaining budget.
    Admit,
    /// The requested amount does not fit; carries the shortfall.
    Deny {
        /// How much additional budget would need to be freed.
        deficit_mb: VramMb,
    },
    /// The accountant is `Paused` pending reconciliation; no new
    /// admissions are granted regardless of remaining budget.
    Paused,
}

/// Outcome of [`VramAccountant::select_eviction_victims`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionPlan {
    /// A victim set whose cumulative reservation covers the deficit.
    Victims(Vec<ModelId>),
    /// No feasible victim set exists (protected models alone exceed the
    /// requirement, or there is simply nothing evictable).
    Infeasible,
}

/// One candidate considered for eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// The model in question.
    pub model_id: ModelId,
    /// Its configured priority; `Priority::max()` is never evictable.
    pub priority: Priority,
    /// Unix milliseconds of its last use, used as the tie-breaker.
    pub last_used_at_ms: u64,
    /// Its current reservation.
    pub reserved_mb: VramMb,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    reserved_mb: VramMb,
}

/// Tracks VRAM reservations against a fixed budget and decides admission.
/// Every public method is synchronous and non-blocking; callers are
/// expected to hold this behind a single mutex so it is never locked across
/// a backend call (SPEC_FULL.md §4.7, §5).
pub struct VramAccountant {
    budget_mb: VramMb,
    reservations: HashMap<String, Reservation>,
    total_reserved_mb: VramMb,
    paused: bool,
}

impl VramAccountant {
    /// Creates an accountant for a fixed `budget_mb`.
    #[must_use]
    pub fn new(budget_mb: VramMb) -> Self {
        Self {
            budget_mb,
            reservations: HashMap::new(),
            total_reserved_mb: VramMb::default(),
            paused: false,
        }
    }

    /// True once an accounting inconsistency has been detected and no new
    /// admissions are being granted.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Enters `Paused`: subsequent [`Self::can_admit`] calls deny until
    /// [`Self::reconcile`] succeeds.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Recomputes the running total from the individual reservations and,
    /// if it agrees with [`Self::total_reserved_mb`], clears `Paused`.
    ///
    /// # Errors
    ///
    /// Returns [`VramError::Inconsistent`] if the recomputed total still
    /// disagrees with the recorded one; the accountant remains paused.
    pub fn reconcile(&mut self) -> Result<(), VramError> {
        let recomputed: u64 = self
            .reservations
            .values()
            .map(|r| r.reserved_mb.into_inner())
            .sum();
        if recomputed != self.total_reserved_mb.into_inner() {
            self.paused = true;
            return Err(VramError::Inconsistent {
                recorded: self.total_reserved_mb.into_inner(),
                recomputed,
            });
        }
        self.paused = false;
        Ok(())
    }

    fn check_consistency(&mut self) -> Result<(), VramError> {
        let recomputed: u64 = self
            .reservations
            .values()
            .map(|r| r.reserved_mb.into_inner())
            .sum();
        if recomputed != self.total_reserved_mb.into_inner() {
            self.paused = true;
            return Err(VramError::Inconsistent {
                recorded: self.total_reserved_mb.into_inner(),
                recomputed,
            });
        }
        Ok(())
    }

    /// Current total reserved across all models.
    #[must_use]
    pub fn total_reserved_mb(&self) -> VramMb {
        self.total_reserved_mb
    }

    /// The fixed budget this accountant enforces.
    #[must_use]
    pub fn budget_mb(&self) -> VramMb {
        self.budget_mb
    }

    /// Pure admission check: would reserving `mb` more fit within budget?
    /// Always denies (via [`Admission::Paused`]) while the accountant is
    /// `Paused`, regardless of remaining budget.
    #[must_use]
    pub fn can_admit(&self, mb: VramMb) -> Admission {
        if self.paused {
            return Admission::Paused;
        }
        let projected = self.total_reserved_mb.saturating_add(mb);
        if projected.into_inner() <= self.budget_mb.into_inner() {
            Admission::Admit
        } else {
            let deficit = projected.into_inner() - self.budget_mb.into_inner();
            Admission::Deny {
                deficit_mb: VramMb::try_new(deficit).unwrap_or_else(|_| self.budget_mb),
            }
        }
    }

    /// Reserves `mb` for `model_id`. A model is in the reservation table
    /// iff it is `Loaded` or `Loading` (§4.7 invariant); the Model Manager
    /// is responsible for calling this exactly once per admission.
    ///
    /// # Errors
    ///
    /// Returns [`VramError::AlreadyReserved`] if `model_id` already holds a
    /// reservation, or [`VramError::Inconsistent`] if the running total no
    /// longer agrees with the sum of individual reservations, in which case
    /// the accountant enters `Paused`.
    pub fn reserve(&mut self, model_id: &ModelId, mb: VramMb) -> Result<(), VramError> {
        if self.reservations.contains_key(&model_id.to_string()) {
            return Err(VramError::AlreadyReserved(model_id.to_string()));
        }
        self.reservations
            .insert(model_id.to_string(), Reservation { reserved_mb: mb });
        self.total_reserved_mb = self.total_reserved_mb.saturating_add(mb);
        self.check_consistency()
    }

    /// Releases `model_id`'s reservation.
    ///
    /// # Errors
    ///
    /// Returns [`VramError::NotReserved`] if `model_id` holds no
    /// reservation, or [`VramError::Inconsistent`] if the running total no
    /// longer agrees with the sum of individual reservations, in which case
    /// the accountant enters `Paused`.
    pub fn release(&mut self, model_id: &ModelId) -> Result<VramMb, VramError> {
        let reservation = self
            .reservations
            .remove(&model_id.to_string())
            .ok_or_else(|| VramError::NotReserved(model_id.to_string()))?;
        self.total_reserved_mb = self.total_reserved_mb.saturating_sub(reservation.reserved_mb);
        self.check_consistency()?;
        Ok(reservation.reserved_mb)
    }

    /// Current reservation for `model_id`, if any.
    #[must_use]
    pub fn reserved_for(&self, model_id: &ModelId) -> Option<VramMb> {
        self.reservations
            .get(&model_id.to_string())
            .map(|r| r.reserved_mb)
    }

    /// Selects a deterministic eviction victim set covering `required_mb`,
    /// drawn from `candidates` (models the Model Manager reports as
    /// currently evictable: `Loaded`, not `Loading`, not pinned by an
    /// in-flight inference). Ordering is ascending `(priority, last_used_at)`
    /// with `Priority::max()` excluded entirely (§4.7).
    #[must_use]
    pub fn select_eviction_victims(
        &self,
        required_mb: VramMb,
        candidates: &[EvictionCandidate],
    ) -> EvictionPlan {
        let max_priority = Priority::max();
        let mut pool: Vec<&EvictionCandidate> = candidates
            .iter()
            .filter(|c| c.priority != max_priority)
            .collect();
        pool.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.last_used_at_ms.cmp(&b.last_used_at_ms))
        });

        let mut victims = Vec::new();
        let mut covered = VramMb::default();
        for candidate in pool {
            if covered.into_inner() >= required_mb.into_inner() {
                break;
            }
            victims.push(candidate.model_id.clone());
            covered = covered.saturating_add(candidate.reserved_mb);
        }

        if covered.into_inner() >= required_mb.into_inner() {
            EvictionPlan::Victims(victims)
        } else {
            EvictionPlan::Infeasible
        }
    }
}
