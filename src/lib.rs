//! Stagehand — multi-repository CI and ephemeral-environment orchestrator.
//!
//! Operators register source repositories; a single background watcher
//! mirrors their remote heads and tags, builds each changed branch through
//! a declarative per-branch pipeline, and composes selected built branches
//! into "deployments" whose services are merged into one docker-compose
//! manifest applied to the local runtime.
//!
//! ## Module Map
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Entities, status enums, forms, config + compose models  |
//! | `errors`   | Sentinel kinds + path/params error annotation           |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `store`    | Per-entity storage ports + the SQLite adapter           |
//! | `exec`     | Subprocess port with captured output                    |
//! | `vcs`      | VCS port + git adapter (clone / ls-remote / switch)     |
//! | `vars`     | Variable listing and `{NAME}` substitution              |
//! | `manifest` | Manifest codec, base manifest, service merge            |
//! | `repos`    | Repository admission + download/sync jobs               |
//! | `branches` | Branch reconciliation + build pipeline + re-enqueue map |
//! | `deploys`  | Deployment lifecycle + compose merge + apply            |
//! | `watcher`  | Sequential periodic job driver                          |
//! | `hook`     | Optional remote hook handler client                     |
//! | `api`      | axum handlers and error mapping                         |
//! | `server`   | Wiring, router assembly, startup                        |

pub mod api;
pub mod branches;
pub mod clock;
pub mod config;
pub mod db;
pub mod deploys;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod hook;
pub mod manifest;
pub mod models;
pub mod repos;
pub mod server;
pub mod store;
pub mod vars;
pub mod vcs;
pub mod watcher;
