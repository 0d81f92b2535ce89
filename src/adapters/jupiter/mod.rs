//! Jupiter Adapter
//!
//! `SwapService` over the Jupiter aggregator: quote fetching, swap building and
//! signed submission. Used to liquidate residual token X after an exit.

mod client;
mod quote;
mod service;
mod swap;

pub use client::{JupiterClient, JupiterConfig};
pub use quote::{QuoteRequest, QuoteResponse};
pub use service::JupiterSwapService;
pub use swap::{SwapRequest, SwapResponse};
