//! Live spoken coaching session with a remote voice agent.
//!
//! `vibe_coach` streams the microphone to the agent through `vibe_relay` and plays the
//! agent's replies back gaplessly; `vibe_relay` holds the credential and bridges each
//! local session to the agent.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;
pub mod relay;
pub mod score;
