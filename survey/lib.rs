#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod catalog;
pub mod clean;
pub mod codebook;
pub mod extract;
pub mod label;
pub mod missing;
pub mod pipeline;
pub mod sav;

#[path = "../shared/config.rs"]
pub mod shared_config;
#[path = "../shared/frame.rs"]
pub mod shared_frame;
#[path = "../shared/linalg.rs"]
pub mod shared_linalg;
#[path = "../shared/plot.rs"]
pub mod shared_plot;
#[path = "../shared/progress.rs"]
pub mod shared_progress;
#[path = "../shared/stats.rs"]
pub mod shared_stats;
pub mod shared {
    pub use super::shared_config as config;
    pub use super::shared_frame as frame;
    pub use super::shared_linalg as linalg;
    pub use super::shared_plot as plot;
    pub use super::shared_progress as progress;
    pub use super::shared_stats as stats;
}

#[path = "../impute/mod.rs"]
pub mod impute;

#[path = "../reduce/mod.rs"]
pub mod reduce;

// Mixed models, pooling and the forest check
#[path = "../analyze/mod.rs"]
pub mod analyze;
