mod query_tests;
mod teardown_tests;
