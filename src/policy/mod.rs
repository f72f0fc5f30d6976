//! Activation rule evaluation.

pub mod component;
pub mod rules;
