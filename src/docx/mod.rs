pub mod anchors;
pub mod build;
pub mod manifest;
pub mod package;
pub mod parts;
pub mod write;
pub mod xml;
