pub mod config;
pub mod dashboard;
pub mod db;
pub mod engine;
pub mod error;
pub mod gating;
pub mod lifecycle;
pub mod market;
pub mod pricing;
