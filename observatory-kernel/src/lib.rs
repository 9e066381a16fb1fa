//! Observatory supervisor kernel.
//!
//! Device daemons are reached through `proxy` handles owned by one `worker`
//! task each. The `controller` and `master` state machines, the schedule
//! `executor` and the `watchdog` all read the shared snapshot registry held
//! by the `context`; operators talk to the `command_server` and read the
//! `http` API.

pub mod alarms;
pub mod alerts;
pub mod bus;
pub mod command_server;
pub mod config;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod executor;
pub mod health;
pub mod http;
pub mod master;
pub mod models;
pub mod periodic;
pub mod proxy;
pub mod schedule;
pub mod state;
pub mod supervisor;
pub mod watchdog;
pub mod worker;
