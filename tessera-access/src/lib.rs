// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decentralised access control for replicated, append-only logs.
//!
//! An [`AccessController`] decides which devices may append to a log it governs. It keeps a
//! role table, itself a replicated log, granting one of two [roles](Role) to identities: single
//! devices (public keys) or accounts (addresses of other access controllers). Members of a granted
//! account inherit the role, so a user can add all their devices to a controller by granting
//! their account once. Accounts can be nested into each other arbitrarily, cycles included.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │ controller A │  owner: a1
//!                 └──────┬───────┘
//!              MODERATOR │   MEMBER
//!            ┌───────────┴────────────┐
//!      ┌─────┴─────┐               ┌──┴─┐
//!      │ account B │  owner: b1    │ c1 │
//!      └─────┬─────┘               └────┘
//!            │ MEMBER
//!          ┌─┴──┐
//!          │ b2 │   devices of A: a1, b1, b2 (MODERATOR), c1 (MEMBER)
//!          └────┘
//! ```
//!
//! Controllers are created and opened through a [`Registry`], which holds the device identity of
//! the process and makes sure every controller is opened once, no matter how many other
//! controllers refer to it. Nested accounts are resolved in the background, an account which can
//! not be reached (yet) grants nothing until it can.
//!
//! Whether an entry may be appended is answered from local state only, through
//! [`AccessController::can_append`] or the [`AppendGuard`](tessera_store::AppendGuard) returned by
//! [`AccessController::guard`].
//!
//! Revoking roles is not supported.
pub mod address;
pub mod config;
mod controller;
pub mod identity;
pub mod manifest;
mod registry;
mod resolver;
pub mod role;
pub mod role_table;
mod subscription;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use address::{Address, AddressError};
pub use config::AccessConfig;
pub use controller::{AccessController, ControllerError};
pub use identity::{IdentityKind, IdentityRef, IdentityRefError};
pub use manifest::{DEFAULT_CONTROLLER_TYPE, Manifest, ManifestError};
pub use registry::{Registry, RegistryBuilder, RegistryEvent};
pub use resolver::AccessSet;
pub use role::{Role, RoleError};
pub use subscription::Subscription;
