pub mod aggregate;
pub mod api;
pub mod config;
pub mod epiweek;
pub mod error;
pub mod etl;
pub mod fetch;
pub mod normalize;
pub mod output;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
