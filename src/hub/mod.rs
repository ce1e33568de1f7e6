//! Fleet hub: the HTTP back-end that coordinates remote coding agents.
//!
//! ## Overview
//!
//! Users organise work into initiatives, connect repositories and create
//! tasks. Runnable tasks are handed to a remote execution provider; the
//! provider reports back through signed webhooks (or on-demand status sync),
//! and the lifecycle controller turns those events into task state, agent
//! messages, hourly metrics and the promotion of dependent tasks.
//!
//! ## Module Map
//!
//! ```text
//! ┌───────────┐  HTTP   ┌──────────────────────────────────────────────────┐
//! │ Dashboard │ ──────> │  server.rs  (Router, ServerConfig)               │
//! │  / CLI    │ <────── │    ├─ api.rs      (handlers, AppState, ApiError) │
//! └───────────┘   ws    │    ├─ auth.rs     (bearer token → CurrentUser)   │
//!                       │    └─ webhook.rs  (HMAC check, event ingress)    │
//! ┌───────────┐ webhook │         │                                        │
//! │ Provider  │ ──────> │         v                                        │
//! │           │ <────── │  lifecycle.rs  (apply_event, sync_snapshot)      │
//! └───────────┘  REST   │  dispatch.rs   (prompt templates, hand-off)      │
//!                       │  gateway.rs    (ExecutionGateway, client)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                            |
//! |-----------|-----------------------------------------------------------|
//! | `models`  | Records and enums: `Task`, `Initiative`, `AgentMessage`   |
//! | `db`      | SQLite store behind `DbHandle` (`Arc<Mutex<_>>`)          |
//! | `dag`     | Dependency graph validation (unknown ids, cycles)         |
//! | `github`  | Token format check and `GET /user` lookup                 |
//! | `ws`      | `WsMessage` live feed + `broadcast_message()`             |

pub mod api;
pub mod auth;
pub mod dag;
pub mod db;
pub mod dispatch;
pub mod gateway;
pub mod github;
pub mod lifecycle;
pub mod models;
pub mod server;
pub mod webhook;
pub mod ws;
