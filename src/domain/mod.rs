pub mod models;
pub mod polling;
pub mod settings;
