// tests/property/mod.rs

mod deframe_test;
