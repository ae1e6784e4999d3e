pub mod backlog;
pub mod core;
pub mod records;
pub mod results;
pub mod views;
