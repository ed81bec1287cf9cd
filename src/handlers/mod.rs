//! HTTP handlers

pub mod actions;
pub mod admin;
pub mod health;
pub mod rules;
pub mod scans;
