pub mod aggregates;
pub mod core;
pub mod rounds;
pub mod statistics;
