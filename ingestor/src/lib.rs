pub mod batching;
pub mod config;
pub mod db;
pub mod errors;
pub mod live;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod processor;
pub mod publisher;
pub mod registry;
pub mod resolver;
pub mod rest;
pub mod service;
pub mod store;
pub mod tasks;
pub mod trend;
pub mod validate;
