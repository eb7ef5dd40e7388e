#[path = "../common/mod.rs"]
mod common;

mod concurrency;
mod contract;
mod persistence;
