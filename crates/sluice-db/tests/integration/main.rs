mod common;
mod metrics_store_tests;
mod queue_tests;
