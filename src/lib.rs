// The binary drives the orchestration surface; everything else is exposed
// because it appears in that surface's signatures.
pub mod backupmgr;
pub mod blueprint;
pub mod command;
pub mod config;
pub mod nodes;
pub mod poll;
pub mod pool;
pub mod remote;
pub mod report;
pub mod results;
pub mod shutdown;

#[cfg(test)]
mod integ_tests;
