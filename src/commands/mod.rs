//! CLI subcommand implementations that need more than a line in `main`.

// Rust guideline compliant 2026-02

pub mod request;
