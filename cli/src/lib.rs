pub mod config;
pub mod driver;
pub mod repl;

pub use config::DriverConfig;
pub use driver::Driver;
