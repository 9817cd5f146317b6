//! CLI command implementations.
//!
//! | Module    | Commands handled  |
//! |-----------|-------------------|
//! | `serve`   | `Serve`, `Init`   |
//! | `user`    | `User`            |
//! | `config`  | `Config`          |

pub mod config;
pub mod serve;
pub mod user;

pub use config::cmd_config;
pub use serve::{cmd_init, cmd_serve};
pub use user::cmd_user;
