use reapguard_core::ProcessTermination;
use std::sync::Arc;

/// Platform-independent factory that selects the signal implementation at compile time
pub struct PlatformTerminationFactory;

impl PlatformTerminationFactory {
    #[cfg(unix)]
    pub fn create() -> Arc<dyn ProcessTermination> {
        Arc::new(reapguard_unix::UnixProcessManagerFactory::create_process_manager())
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return reapguard_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(not(unix))]
        return "unsupported";
    }
}
