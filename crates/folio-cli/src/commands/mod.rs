pub mod chapters;
pub mod config;
pub mod maintenance;
pub mod session;
pub mod status;
