pub mod artifacts;
pub mod audit;
pub mod cancel;
pub mod catchup;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod floor;
pub mod invoker;
pub mod monitor;
pub mod paths;
pub mod planner;
pub mod progress;
pub mod run_lock;
pub mod transcript;
pub mod util;
pub mod warn;
