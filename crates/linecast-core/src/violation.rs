// crates/linecast-core/src/violation.rs
//
// Contract-violation taxonomy. Every violation carries a stable log tag;
// dashboards and the property tests grep for these strings, so they never
// change spelling.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationClass {
    /// Session-fatal protocol breach. Logged, counted, session terminated
    /// once a safe state is reached. Never silently recovered.
    FatalProtocol,
    /// Timing excursion. Logged and metered; the switch still executes
    /// deadline-authoritatively (except lead-time, which tears the boundary
    /// down before issuance).
    BoundedTiming,
    /// Content-side deficit. Handled locally (fill, truncate, stall);
    /// visible only through metrics and logs.
    ContentDeficit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Violation {
    StaleFrameBleed,
    FrameAuthorityVacuum,
    PostBarrierWrite,
    DuplicateIssuance,
    PlanBoundaryMismatch,
    ResetWhileArmed,
    LeadTime,
    BoundaryTolerance,
    PadWhileDepthHigh,
    BackpressureAsymmetry,
    EarlyEof,
}

impl Violation {
    pub fn tag(self) -> &'static str {
        match self {
            Violation::StaleFrameBleed => "STALE_FRAME_BLEED",
            Violation::FrameAuthorityVacuum => "FRAME_AUTHORITY_VACUUM",
            Violation::PostBarrierWrite => "POST_BARRIER_WRITE",
            Violation::DuplicateIssuance => "DUPLICATE_ISSUANCE",
            Violation::PlanBoundaryMismatch => "PLAN_BOUNDARY_MISMATCH",
            Violation::ResetWhileArmed => "RESET_WHILE_ARMED",
            Violation::LeadTime => "LEAD_TIME_VIOLATION",
            Violation::BoundaryTolerance => "BOUNDARY_TOLERANCE_VIOLATION",
            Violation::PadWhileDepthHigh => "PAD_WHILE_DEPTH_HIGH",
            Violation::BackpressureAsymmetry => "BACKPRESSURE_ASYMMETRY",
            Violation::EarlyEof => "EARLY_EOF",
        }
    }

    pub fn class(self) -> ViolationClass {
        match self {
            Violation::StaleFrameBleed
            | Violation::FrameAuthorityVacuum
            | Violation::PostBarrierWrite
            | Violation::DuplicateIssuance
            | Violation::PlanBoundaryMismatch
            | Violation::ResetWhileArmed => ViolationClass::FatalProtocol,
            Violation::LeadTime | Violation::BoundaryTolerance | Violation::PadWhileDepthHigh | Violation::BackpressureAsymmetry => {
                ViolationClass::BoundedTiming
            }
            Violation::EarlyEof => ViolationClass::ContentDeficit,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.class() == ViolationClass::FatalProtocol
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_the_stable_wire_strings() {
        assert_eq!(Violation::StaleFrameBleed.tag(), "STALE_FRAME_BLEED");
        assert_eq!(Violation::LeadTime.tag(), "LEAD_TIME_VIOLATION");
        assert_eq!(Violation::BoundaryTolerance.tag(), "BOUNDARY_TOLERANCE_VIOLATION");
        assert_eq!(Violation::PadWhileDepthHigh.tag(), "PAD_WHILE_DEPTH_HIGH");
        assert_eq!(Violation::EarlyEof.tag(), "EARLY_EOF");
    }

    #[test]
    fn protocol_breaches_are_fatal_and_timing_is_not() {
        assert!(Violation::StaleFrameBleed.is_fatal());
        assert!(Violation::ResetWhileArmed.is_fatal());
        assert!(Violation::PostBarrierWrite.is_fatal());
        assert!(!Violation::BoundaryTolerance.is_fatal());
        assert!(!Violation::LeadTime.is_fatal());
        assert_eq!(Violation::EarlyEof.class(), ViolationClass::ContentDeficit);
    }
}
