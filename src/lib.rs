pub mod ai;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod guard;
pub mod knowledge;
pub mod output;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod sender;
pub mod trigger;
