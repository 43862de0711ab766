//! Driver Onboard — conversation orchestration for driver onboarding.

pub mod catalog;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod otp;
pub mod partner;
pub mod store;
pub mod worker;
