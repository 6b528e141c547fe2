//! # Resource Ledger - Admission Control
//!
//! Tracks CPU and GPU capacity against what running project containers have
//! reserved. Admission is a single critical section: the capacity check and
//! the reservation happen under one lock, so no concurrent caller can observe
//! or act on the gap between them.
//!
//! ## Invariant
//!
//! ```text
//! cpu_used ≤ cpu_capacity    gpu_used ≤ gpu_capacity    (always)
//! ```
//!
//! Rejection is an ordinary return value ([`Admission::Rejected`]) carrying
//! every unmet condition in a fixed order: GPU, CPU, then any preconditions
//! the caller supplied (missing image, job in progress).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// CPU/GPU units a project asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    /// CPU units.
    pub cpu: u32,
    /// GPU units.
    pub gpu: u32,
}

impl ResourceDemand {
    /// Creates a demand.
    #[must_use]
    pub fn new(cpu: u32, gpu: u32) -> Self {
        Self { cpu, gpu }
    }
}

/// Units held by an admitted project. Returned to the ledger on release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservation {
    /// CPU units held.
    pub cpu: u32,
    /// GPU units held.
    pub gpu: u32,
}

impl Reservation {
    fn max(self, other: Self) -> Self {
        Self {
            cpu: self.cpu.max(other.cpu),
            gpu: self.gpu.max(other.gpu),
        }
    }

    fn min(self, other: Self) -> Self {
        Self {
            cpu: self.cpu.min(other.cpu),
            gpu: self.gpu.min(other.gpu),
        }
    }
}

impl From<ResourceDemand> for Reservation {
    fn from(demand: ResourceDemand) -> Self {
        Self {
            cpu: demand.cpu,
            gpu: demand.gpu,
        }
    }
}

/// Why a create request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Not enough free GPU units.
    GpuInsufficient { requested: u32, available: u32 },
    /// Not enough free CPU units.
    CpuInsufficient { requested: u32, available: u32 },
    /// The requested image is not in the catalog.
    ImageMissing { image: String },
    /// A job is currently streaming in the project's container.
    JobInProgress { project_id: u64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GpuInsufficient {
                requested,
                available,
            } => write!(f, "GPU resources insufficient ({requested} requested, {available} free)"),
            Self::CpuInsufficient {
                requested,
                available,
            } => write!(f, "CPU resources insufficient ({requested} requested, {available} free)"),
            Self::ImageMissing { image } => write!(f, "image does not exist: {image}"),
            Self::JobInProgress { project_id } => {
                write!(f, "project {project_id} has a job in progress")
            }
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Capacity reserved.
    Admitted(Reservation),
    /// Nothing reserved; every unmet condition in order.
    Rejected(Vec<RejectReason>),
}

impl Admission {
    /// Returns true if admitted.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub cpu_capacity: u32,
    pub cpu_used: u32,
    pub gpu_capacity: u32,
    pub gpu_used: u32,
}

impl LedgerSnapshot {
    /// Free CPU units.
    #[must_use]
    pub fn cpu_free(&self) -> u32 {
        self.cpu_capacity.saturating_sub(self.cpu_used)
    }

    /// Free GPU units.
    #[must_use]
    pub fn gpu_free(&self) -> u32 {
        self.gpu_capacity.saturating_sub(self.gpu_used)
    }
}

/// Process-wide CPU/GPU ledger.
///
/// Injected into the lifecycle manager as an `Arc<ResourceLedger>`; all
/// mutation goes through [`admit`](Self::admit), [`admit_with`](Self::admit_with),
/// [`settle`](Self::settle) and [`release`](Self::release).
#[derive(Debug)]
pub struct ResourceLedger {
    inner: Mutex<LedgerSnapshot>,
}

impl ResourceLedger {
    /// Creates a ledger with the given capacities and nothing used.
    #[must_use]
    pub fn new(cpu_capacity: u32, gpu_capacity: u32) -> Self {
        Self {
            inner: Mutex::new(LedgerSnapshot {
                cpu_capacity,
                cpu_used: 0,
                gpu_capacity,
                gpu_used: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerSnapshot> {
        // Counters stay consistent even if a holder panicked: every update is
        // a single assignment after the checks.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Checks and reserves `demand` atomically.
    pub fn admit(&self, demand: ResourceDemand) -> Admission {
        self.admit_with(demand, None, Vec::new())
    }

    /// Checks and reserves `demand` atomically, with extra conditions.
    ///
    /// * `replacing` - a reservation the caller already holds and will give up
    ///   once the new one is in place. Its units count as free for this check.
    ///   Used when a create supersedes the project's previous container.
    ///
    /// When replacing, the returned reservation covers both the old and the
    /// new units (per-axis maximum), so nothing the old container still uses
    /// becomes visible as free. The caller narrows it with
    /// [`settle`](Self::settle) once it knows which of the two survives.
    /// * `preconditions` - reasons already known to fail; appended after the
    ///   capacity reasons. Any precondition rejects the request.
    pub fn admit_with(
        &self,
        demand: ResourceDemand,
        replacing: Option<Reservation>,
        preconditions: Vec<RejectReason>,
    ) -> Admission {
        let mut ledger = self.lock();
        let credit = replacing.unwrap_or_default();

        let gpu_used = ledger.gpu_used.saturating_sub(credit.gpu);
        let cpu_used = ledger.cpu_used.saturating_sub(credit.cpu);
        let gpu_free = ledger.gpu_capacity.saturating_sub(gpu_used);
        let cpu_free = ledger.cpu_capacity.saturating_sub(cpu_used);

        let mut reasons = Vec::new();
        if demand.gpu > gpu_free {
            reasons.push(RejectReason::GpuInsufficient {
                requested: demand.gpu,
                available: gpu_free,
            });
        }
        if demand.cpu > cpu_free {
            reasons.push(RejectReason::CpuInsufficient {
                requested: demand.cpu,
                available: cpu_free,
            });
        }
        reasons.extend(preconditions);

        if !reasons.is_empty() {
            debug!(?demand, ?reasons, "admission rejected");
            return Admission::Rejected(reasons);
        }

        // demand ≤ free on both axes and the credit was already held, so
        // neither axis can exceed capacity
        let held = Reservation::from(demand).max(credit);
        ledger.gpu_used = gpu_used + held.gpu;
        ledger.cpu_used = cpu_used + held.cpu;
        debug!(
            cpu_used = ledger.cpu_used,
            gpu_used = ledger.gpu_used,
            "admission granted"
        );

        Admission::Admitted(held)
    }

    /// Narrows `held` to `keep`, returning the units `held` has beyond it.
    ///
    /// Returns the reservation still held afterwards (`keep`, capped by
    /// `held` on each axis).
    pub fn settle(&self, held: Reservation, keep: Reservation) -> Reservation {
        let kept = held.min(keep);
        self.release(Reservation {
            cpu: held.cpu - kept.cpu,
            gpu: held.gpu - kept.gpu,
        });
        kept
    }

    /// Returns a reservation to the ledger. Never drives usage below zero.
    pub fn release(&self, reservation: Reservation) {
        let mut ledger = self.lock();
        if reservation.cpu > ledger.cpu_used || reservation.gpu > ledger.gpu_used {
            warn!(
                ?reservation,
                cpu_used = ledger.cpu_used,
                gpu_used = ledger.gpu_used,
                "release exceeds usage, flooring at zero"
            );
        }
        ledger.cpu_used = ledger.cpu_used.saturating_sub(reservation.cpu);
        ledger.gpu_used = ledger.gpu_used.saturating_sub(reservation.gpu);
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        *self.lock()
    }
}
