//! Core engines, kept free of HTTP concerns so they test against an
//! in-memory database

pub mod actions;
pub mod aggregate;
pub mod anonymize;
pub mod classify;
pub mod collector;
pub mod export;
pub mod rules;
pub mod scan;
