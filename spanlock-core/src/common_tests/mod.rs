//! Reusable test suites for `RangeLock` implementations.
//!
//! The functions here are generic over the lock type so every variant (and
//! every reclamation guard) runs the same correctness and stress checks.
//! Crate-level integration tests and the epoch crate's tests instantiate
//! them per implementation.
