//! stratum-lib: build layered OS root filesystem images and extract them for boot
//!
//! This crate provides the pieces behind the `stratum` command:
//! - `image`: per-image definitions and the validated inheritance graph
//! - `backend`: the privileged execution contract, with a container-CLI
//!   backend and a native overlay/namespace runtime
//! - `session`: one ephemeral environment per operation, always torn down
//! - `build`: builds images in inheritance order on top of their parents
//! - `extract`: copies an image's staged content out through a snapshot
//! - `gc`: reclaims unused layers and snapshots in the native store

pub mod backend;
pub mod build;
pub mod cancel;
pub mod config;
pub mod consts;
pub mod extract;
pub mod gc;
pub mod image;
pub mod mount;
pub mod platform;
pub mod session;
pub mod snapshot;
pub mod store_lock;
pub mod util;
