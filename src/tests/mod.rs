//! Cross-module scenario tests and shared fixtures.


mod orchestration;
