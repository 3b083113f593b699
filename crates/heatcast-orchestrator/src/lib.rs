#![forbid(unsafe_code)]

mod batch;
mod pipeline;

pub use batch::{
    run_batch, BatchConfig, BatchFailure, BatchReport, SkipReason, BATCH_REPORT_CONTRACT_VERSION,
};
pub use pipeline::Pipeline;
