mod common;
mod dispatch_tests;
mod pipeline_tests;
