// tests/integration_test.rs

//! End-to-end scenario tests for the Host: a real `axum` server bound to a
//! loopback port, driven with `reqwest`, backed by real fake-runner HTTP
//! servers standing in for the Runner Agent side of each RPC (spec.md §8,
//! seed scenarios S1-S6).

mod integration {
    pub mod s1_happy_path_test;
    pub mod s3_vps_recovery_test;
    pub mod s4_ip_reservation_test;
    pub mod s5_suspicion_test;
    pub mod s6_approval_test;
    pub mod test_helpers;
}
