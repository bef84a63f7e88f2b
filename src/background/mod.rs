//! Background maintenance tasks.

pub mod roomba;

pub use roomba::{run_roomba, sweep, sweep_and_forget, SweepSummary};
