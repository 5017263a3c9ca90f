pub mod installer;
pub mod launcher;
pub mod manifest;
pub mod registry;
pub mod supervisor;
pub mod types;
pub mod update;
