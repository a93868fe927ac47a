//! ui
//!
//! User interaction utilities.
//!
//! # Modules
//!
//! - [`view`] - Progress events and the `View` trait
//! - [`human`] - Terminal rendering
//! - [`json`] - Machine-readable rendering
//! - [`prompts`] - Interactive and scripted prompts
//! - [`output`] - Verbosity and plain command messages
//!
//! # Design
//!
//! The UI module provides a consistent interface for user interaction.
//! The engine only produces events and asks questions through traits, so
//! interactive, non-interactive and test runs share one code path.

pub mod human;
pub mod json;
pub mod output;
pub mod prompts;
pub mod view;
