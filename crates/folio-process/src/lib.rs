//! # folio-process
//!
//! Child process supervision for the FOLIO Mapper desktop shell.
//!
//! The model runtime starts the local inference server as a child process and
//! must be able to stop it reliably, including any helper processes it forks.
//! This crate wraps `tokio::process` with:
//!
//! - **Spawning** with explicit stdio, environment and working directory
//! - **PID tracking** for status reporting
//! - **Graceful shutdown** with a bounded wait
//! - **Process tree kill** (process group on Unix, `taskkill /t` on Windows)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use folio_process::{ProcessConfig, ProcessManager};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProcessManager::new();
//!
//! let config = ProcessConfig::new("llamafile")
//!     .args(["--server", "--nobrowser", "--port", "8080"])
//!     .capture_stdout(false);
//!
//! let child = manager.spawn(config).await?;
//! manager.kill_tree(child).await?;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod manager;

pub use child::ManagedChild;
pub use config::ProcessConfig;
pub use error::{ProcessError, Result};
pub use manager::ProcessManager;
