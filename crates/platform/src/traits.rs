//! Lifecycle trait for long-lived daemon subsystems

use crate::PlatformResult;

/// A subsystem with explicit startup and teardown.
///
/// Process-wide state (registries, counters, timer wheels) is created by the
/// owner, brought up with [`SecurityModule::init`] and torn down with
/// [`SecurityModule::shutdown`], never lazily on first use.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Module description
    fn description(&self) -> &'static str;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&mut self) -> PlatformResult<()> {
        Ok(())
    }

    /// Shutdown the module, releasing everything `init` acquired
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> PlatformResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlatformError;

    struct Counter {
        starts: u32,
        stops: u32,
    }

    impl SecurityModule for Counter {
        fn id(&self) -> &'static str {
            "counter"
        }

        fn description(&self) -> &'static str {
            "counts lifecycle calls"
        }

        fn init(&mut self) -> PlatformResult<()> {
            if self.starts > self.stops {
                return Err(PlatformError::Lifecycle("already running".into()));
            }
            self.starts += 1;
            Ok(())
        }

        fn shutdown(&mut self) -> PlatformResult<()> {
            self.stops += 1;
            Ok(())
        }
    }

    #[test]
    fn test_default_version() {
        let module = Counter { starts: 0, stops: 0 };
        assert_eq!(module.version(), crate::VERSION);
    }

    #[test]
    fn test_double_init_rejected() {
        let mut module = Counter { starts: 0, stops: 0 };
        module.init().unwrap();
        assert!(module.init().is_err());
        module.shutdown().unwrap();
        module.init().unwrap();
        assert_eq!(module.starts, 2);
    }
}
