//! Core storage logic: physical naming and the single-slot store.

pub mod naming;
pub mod storage_service;
