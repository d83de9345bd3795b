pub mod config;
pub mod db;
pub mod events;
pub mod mail;
pub mod mailbatch;
pub mod render;
pub mod service;
pub mod source;
pub mod template;
pub mod worker;
