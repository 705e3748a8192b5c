pub mod panic_handler;
pub mod preview;
pub mod settings;

pub use preview::{
    DocumentPageSet, Fidelity, PreviewConfig, PreviewDispatcher, PreviewEnv, PreviewError,
    PreviewResult,
};
pub use settings::Settings;
