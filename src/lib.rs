// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(clippy::all))]

#[macro_use]
extern crate log;

mod collections;

pub mod channel;
pub mod collective;
pub mod fabric;
pub mod future;
pub mod naming;
pub mod runtime;
pub mod serialization;
pub mod sync;

pub use crate::runtime::{
    fail::Fail,
    scheduler::{
        TaskHandle,
        Yielder,
        YielderHandle,
    },
    SharedObject,
    SharedTaskRuntime,
};

/// Generation sentinel: selects "next send" / "next receive" on channel and
/// collective operations.
pub const AUTO_GENERATION: u64 = u64::MAX;

/// Site sentinel: selects the calling locality as the receiving site.
pub const THIS_SITE: u64 = u64::MAX;

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, otherwise bails out with an error
/// that prints both values. Test-only counterpart of `assert_eq!`.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)`\nleft: `{:?}`,\nright: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, otherwise bails out with an
/// error that prints both values.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)`\nleft: `{:?}`,\nright: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
