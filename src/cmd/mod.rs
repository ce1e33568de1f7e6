//! CLI command implementations.
//!
//! | Module   | Commands handled        |
//! |----------|-------------------------|
//! | `serve`  | `Serve`, `InitDb`       |
//! | `user`   | `User add`              |
//! | `task`   | `Task wait`             |
//! | `config` | `Config show`           |

pub mod config;
pub mod serve;
pub mod task;
pub mod user;

pub use config::cmd_config_show;
pub use serve::{cmd_init_db, cmd_serve};
pub use task::cmd_task_wait;
pub use user::cmd_user_add;
