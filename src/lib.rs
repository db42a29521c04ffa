pub mod cleaning;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod sites;
pub mod summary;
pub mod table;
pub mod thresholds;

pub use error::{AtcError, ErrorKind};
