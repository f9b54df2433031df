mod config;
mod export;

pub use config::NbdConfigWriter;
pub use export::{export_name, ExportManager, NBD_PORT};
