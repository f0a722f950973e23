pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod output;
pub mod raw;
pub mod recover;
pub mod retry;
pub mod search;
pub mod select;
pub mod workspace;
