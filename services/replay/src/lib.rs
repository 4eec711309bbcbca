pub mod cli;
pub mod local;
pub mod media;
pub mod runner;
pub mod script;
