pub mod classify;
pub mod training;
