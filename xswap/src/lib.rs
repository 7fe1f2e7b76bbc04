#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::print_stdout,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod asset;
pub mod failure;
pub mod fee;
pub mod network;
pub mod order;
pub mod rail;
pub mod registry;
pub mod secret;
pub mod secret_hash;
pub mod simnet;
pub mod swap;

#[cfg(test)]
mod quickcheck;

pub use self::{
    asset::{Amount, Currency},
    failure::{Failure, FailureReason},
    network::{NodeContext, PeerId},
    order::{OrderId, Position, Price, Quantity, TradingPair},
    registry::Registry,
    secret::Secret,
    secret_hash::SecretHash,
    swap::{DealEvent, EngineHandle, SwapDeal, SwapEngine, SwapError, SwapProposal},
};
