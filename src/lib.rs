//! Root crate for the transmission-engine workspace.
//!
//! Holds no runtime code of its own — it exists so that
//! `tests/integration/*.rs` can depend on `engine`, `engine-proto`, and
//! `engine-test-utils` as an ordinary dev-dependent crate.
