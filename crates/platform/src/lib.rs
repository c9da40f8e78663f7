//! # ikev2d platform
//!
//! Shared types for the ikev2d daemon crates.
//!
//! This crate provides:
//! - A platform-level error type (`PlatformError`, `PlatformResult`)
//! - The `SecurityModule` lifecycle trait used to start and stop long-lived subsystems
//!
//! # Examples
//!
//! ```
//! use ikev2d_platform::{SecurityModule, PlatformResult};
//!
//! struct Probe {
//!     running: bool,
//! }
//!
//! impl SecurityModule for Probe {
//!     fn id(&self) -> &'static str {
//!         "probe"
//!     }
//!
//!     fn description(&self) -> &'static str {
//!         "example module"
//!     }
//!
//!     fn init(&mut self) -> PlatformResult<()> {
//!         self.running = true;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> PlatformResult<()> {
//! let mut probe = Probe { running: false };
//! probe.init()?;
//! assert!(probe.running);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{PlatformError, PlatformResult};
pub use traits::SecurityModule;

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
