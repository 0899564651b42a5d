//! Client-level scenario tests.
//!
//! These drive a full [`UsageClient`](crate::UsageClient) (buffer, breaker,
//! worker and a storage adapter) the way an application would.

mod client_scenarios;
