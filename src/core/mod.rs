//! Core modules of the gate engine.
//!
//! Leaves first: `cache`, `scope` and `baseline` know nothing of phases;
//! `runner` wraps a `Checker` with the cache; `phase` drives evaluation;
//! `attest`, `evidence` and `final_gate` persist and judge the outcome.

pub mod attest;
pub mod baseline;
pub mod cache;
pub mod checker;
pub mod config;
pub mod error;
pub mod evidence;
pub mod final_gate;
pub mod glob;
pub mod model;
pub mod output;
pub mod phase;
pub mod runner;
pub mod scope;
pub mod store;
pub mod time;
pub mod validate;
pub mod vcs;
