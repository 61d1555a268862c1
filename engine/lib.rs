#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod cache;
pub mod combine;
pub mod config;
pub mod model;
pub mod predict;
pub mod reduce;
pub mod registry;
pub mod schema;
pub mod summary;
pub mod types;
