pub mod config;
pub mod discovery;
pub mod policy;
pub mod processors;
pub mod proxy;
pub mod registry;
pub mod ring;
pub mod scraper;
pub mod stats;
pub mod watcher;

pub mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
