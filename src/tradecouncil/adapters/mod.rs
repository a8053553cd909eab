// src/tradecouncil/adapters/mod.rs
pub mod common;

pub mod deepseek;
pub mod gemini;
pub mod siliconflow;
