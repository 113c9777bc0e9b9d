//! Switchboard - orchestrator for a voice assistant
//!
//! This library wires pluggable input sources, a reasoning engine, and
//! output sinks together over an in-process message bus, and dispatches
//! validated tool calls to smart devices:
//! - Message bus with bounded per-subscriber queues
//! - Registries of input, output, and tool factories
//! - Typed parameter schemas checked before any side effect
//! - Smart plug, infrared, and weather tools
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Inputs                          │
//! │          Terminal   │   Web   │   ...               │
//! └────────────────────┬────────────────────────────────┘
//!                      │ inbound
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Message Bus                         │
//! └──────────┬─────────────────────────────▲────────────┘
//!            │                             │ outbound
//! ┌──────────▼─────────────────────────────┴────────────┐
//! │           Engine  ──►  Reasoner                      │
//! │             │                                        │
//! │             ▼                                        │
//! │     Tool Registry ──► schema ──► Tool Adapter       │
//! │     (smart plug, infrared, weather)                  │
//! └─────────────────────────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Outputs                         │
//! │          Terminal   │   TTS   │   ...               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod builtin;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod modules;
pub mod reasoning;
pub mod registry;
pub mod schema;
pub mod supervisor;
pub mod tools;

pub use builtin::Registries;
pub use bus::{Envelope, EnvelopeKind, LifecycleKind, MessageBus, Payload, Subscription};
pub use config::{Config, ModuleConfig};
pub use engine::{Engine, EngineState, StateTransition};
pub use error::{Error, ErrorKind, Result};
pub use reasoning::{ConversationContext, Decision, Reasoner};
pub use supervisor::{RunningSystem, StartupReport, Supervisor};
pub use tools::{ToolAdapter, ToolCallRequest, ToolCallResult, ToolFactory, ToolRegistry};
