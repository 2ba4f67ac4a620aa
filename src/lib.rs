// =============================================================================
// BLever.AI gateway
// =============================================================================
//
// Two halves that share one backend client:
//
//   The door    gate::*, routes, proxy, webhook. Runs in front of every page
//               and decides continue / sign-in / pick an org / wait for
//               approval before anything renders.
//
//   The watch   tracker, trackers, upload. Polls the scoring backend for
//               each signed-in tenant view and refuses uploads while a job
//               is running.
// =============================================================================

pub mod api;
pub mod backoff;
pub mod config;
pub mod gate;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod routes;
pub mod tracker;
pub mod trackers;
pub mod upload;
pub mod webhook;
