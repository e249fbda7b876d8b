pub mod config;
pub mod crm;
pub mod db;
pub mod errors;
pub mod funnel;
pub mod logging;
pub mod server;
