//! End-to-end scenario tests for the analysis pipeline.

mod builder_scenarios;
mod pointer_scenarios;
mod ssa_scenarios;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
