pub mod classes;
pub mod core;
pub mod reports;
pub mod score_config;
pub mod scores;
pub mod students;
