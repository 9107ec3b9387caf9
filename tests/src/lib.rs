//! Integration tests for the Campus client core. Everything lives under
//! `#[cfg(test)]`; the crate exports nothing.
