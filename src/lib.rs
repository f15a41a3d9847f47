//! Throughput benchmark for LLaMA pretraining under pluggable parallel
//! training strategies.

pub mod backend;
pub mod benchmark;
pub mod booster;
pub mod config;
pub mod data;
pub mod metrics;
pub mod models;
pub mod plugin;
pub mod profiler;
