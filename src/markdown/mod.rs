pub mod ast;
pub mod code;
pub mod extract;
pub mod grammar;
pub mod media;
pub mod project;
pub mod repair;
pub mod validate;
