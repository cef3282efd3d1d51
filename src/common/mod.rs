pub mod format;
pub mod logger;
pub mod utils;
