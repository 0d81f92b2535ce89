//! dlmm-keeper - Automated DLMM Liquidity Keeper Library
//!
//! Runs independent strategy instances, each managing a chain of two adjacent
//! DLMM positions on Solana: creation, partial-failure cleanup, out-of-range
//! recreation, fee extraction and smart stop-loss.
//!
//! # Modules
//!
//! - `domain`: Instance records, per-instance state, snapshots, decisions, yield ledger
//! - `ports`: Trait abstractions (chain positions, transactions, swaps, wallet, storage, events)
//! - `strategy`: Instance configuration and the recreation / risk decision modules
//! - `application`: Retry policies, market cache, yield workflow, executor and manager
//! - `adapters`: External implementations (Solana, Jupiter, JSON storage, paper pool, CLI)
//! - `config`: Configuration loading and validation

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod strategy;
