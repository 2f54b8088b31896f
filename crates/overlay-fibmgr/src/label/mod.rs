//! Label lifecycle: who references a locally installed label-bearing route.

mod manager;

pub use manager::{LabelClaim, LabelManager};
