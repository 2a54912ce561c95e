//! API types for the Tollgate gateway.
//!
//! `openai` holds the OpenAI-compatible request surface the gateway reads
//! and forwards; `admin` holds the user and policy management payloads.

pub mod admin;
pub mod openai;
