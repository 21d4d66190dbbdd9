pub mod agent;
pub mod approval;
pub mod compact;
pub mod context;
pub mod discovery;
pub mod file_ops;
pub mod git_ops;
pub mod history;
pub mod hooks;
pub mod message;
pub mod models;
pub mod openai;
pub mod project;
pub mod references;
pub mod retry;
pub mod session;
pub mod settings;
pub mod storage;
pub mod usage;

#[cfg(test)]
mod testing;
