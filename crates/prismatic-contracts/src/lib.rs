pub mod batch;
pub mod events;
pub mod models;
pub mod presets;
