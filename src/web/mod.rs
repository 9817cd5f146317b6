//! Server-rendered web application.
//!
//! | Module          | Routes handled                                       |
//! |-----------------|------------------------------------------------------|
//! | `auth`          | `/login`, `/logout`, session extractor               |
//! | `dashboard`     | `/`                                                  |
//! | `tasks`         | `/tasks/**`                                          |
//! | `chat`          | `/chat/**` (pages and actions)                       |
//! | `board`         | `/board/**`                                          |
//! | `calendar`      | `/calendar/**`                                       |
//! | `requests`      | `/requests/**`                                       |
//! | `notifications` | `/notifications/**`                                  |
//! | `admin`         | `/admin/**`                                          |
//! | `attachments`   | `/attachments/**`                                    |
//! | `stream`        | `/events`, `/chat/{id}/events`                       |
//! | `api`           | `/api/**`, `/health`                                 |
//! | `assets`        | `/static/**`                                         |

pub mod admin;
pub mod api;
pub mod assets;
pub mod attachments;
pub mod auth;
pub mod board;
pub mod calendar;
pub mod chat;
pub mod dashboard;
pub mod forms;
pub mod html;
pub mod notifications;
pub mod notify;
pub mod requests;
pub mod respond;
pub mod server;
pub mod state;
pub mod stream;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use server::{build_router, start_server};
pub use state::{AppState, SharedState};
