pub mod budget;
pub mod config;
pub mod cost;
pub mod db;
pub mod delta;
pub mod model;
pub mod paginate;
pub mod retry;
pub mod scheduler;
pub mod significance;
pub mod store;
pub mod workflow;
pub mod youtube;
