//! Shared storage adapter test infrastructure
//!
//! Every adapter runs the same contract tests from [`gateway`]:
//!
//! - **Unit tests (memory, SQLite)**: Fast, in-process tests that run with every `cargo test`
//! - **Integration tests (PostgreSQL, Redis)**: Testcontainers-based, run with `cargo test -- --ignored`
//!
//! # Running tests
//!
//! ```bash
//! cargo test                                    # Memory and SQLite only
//! cargo test --features full -- --ignored       # PostgreSQL and Redis (requires Docker)
//! cargo test --features full -- --include-ignored
//! ```
