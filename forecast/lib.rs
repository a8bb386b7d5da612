#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod artifact;
pub mod config;
pub mod data;
pub mod encoder;
pub mod estimate;
pub mod features;
pub mod forest;
pub mod model;
pub mod predict;
pub mod service;
pub mod split;
pub mod validate;
