//! Per-unit stages after structuring.
//!
//! Each submodule implements exactly one transformation step. The
//! scheduler chains them for every unit and checkpoints after each one.
//!
//! ## Data Flow
//!
//! ```text
//! Unit ──▶ normalize ──▶ segment ──▶ synthesize
//! (md)     (LLM/rules)   (sentences)  (speech engine, single-flight)
//! ```
//!
//! 1. [`normalize`]  — narration-ready text through an explicit
//!    primary → fallback chain; the only stage with LLM network I/O
//! 2. [`segment`]    — sentence packing into sub-units with boundary flags
//! 3. [`synthesize`] — one audio artifact per sub-unit, with skip of
//!    existing artifacts and partial-failure tolerance

pub mod normalize;
pub mod segment;
pub mod synthesize;
