// tests/property_test.rs

//! Property-based tests for invariants that must hold over any reachable
//! scheduler/reservation state (spec.md §8, P1-P2, P6, R1).

#[path = "integration/test_helpers.rs"]
mod test_helpers;

mod property {
    pub mod reservation_test;
    pub mod scheduler_invariants_test;
}
