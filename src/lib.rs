//! Histograph - VCS history mining
//!
//! Extracts commit histories from Git, Subversion, Mercurial and TFS
//! repositories into one harmonized model (sources, events, items, authors,
//! actions), persists it in an embedded database, and runs dependency-ordered
//! analyses over each repository on a worker pool.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod extract;
pub mod model;
pub mod process;
pub mod store;
pub mod workspace;
