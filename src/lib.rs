pub mod bids;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod fs_util;
pub mod output;
pub mod participants;
pub mod paths;
pub mod pipeline;
pub mod relay;
pub mod reorganize;
pub mod runner;
pub mod template;
pub mod validate;

pub use export::export_light;
pub use participants::run_mapping;
pub use reorganize::reorganize_data;
