pub mod batch;
pub mod config;
pub mod error;
pub mod fixers;
pub mod fs_util;
pub mod locator;
pub mod nifti;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod scans;
pub mod settings;
pub mod sidecar;
pub mod stage;
pub mod stages;
pub mod tools;
pub mod unit;
