pub mod preview;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use preview::{
    DocumentId, LoaderConfig, LoaderInput, PageKey, PageRange, PreviewScheduler,
    ProgressiveLoader, SchedulerConfig,
};
pub use settings::Settings;
