pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod runtime;
pub mod series;
pub mod storage;
pub mod strategy;
pub mod utils;

pub mod prelude;
