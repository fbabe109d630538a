mod common;
mod gc_tests;
mod import_tests;
mod validate_tests;
