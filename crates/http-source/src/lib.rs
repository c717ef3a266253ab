//! HTTP(S) source adapter.
//!
//! Provides [`HttpSource`], a [`filerelay_transfer::Source`] backed by
//! `reqwest` that probes with `HEAD` and resumes with `Range` requests.

pub mod client;

pub use client::{Error, HttpSource, HttpSourceConfig};
