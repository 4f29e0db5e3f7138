// Background execution contexts for resource instantiation
pub mod worker;

pub use worker::Worker;
