pub mod clustering;
pub mod correction;
pub mod diagnostics;
pub mod features;
pub mod filter;
pub mod mixture;
pub mod modeling;
pub mod pipeline;
pub mod smoothing;
pub mod stats;
