// ABOUTME: Shared configuration helpers for the Codegate workspace
// ABOUTME: Exposes environment variable names and typed parsing helpers

pub mod constants;
pub mod env;
