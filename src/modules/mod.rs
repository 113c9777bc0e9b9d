//! Input and output modules
//!
//! Inputs capture user text and publish it on the bus. Outputs render the
//! engine's responses. Both are built by factories looked up by type name.

pub mod discord;
pub mod terminal;
pub mod tts;
pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::bus::{Envelope, EnvelopeKind, MessageBus, Subscription};
use crate::config::ModuleConfig;
use crate::registry::ModuleFactory;

/// What a running input module gets from the supervisor
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub bus: MessageBus,
    /// Cancelled when the system shuts down
    pub shutdown: CancellationToken,
}

/// Produces inbound envelopes
#[async_trait]
pub trait InputModule: Send {
    fn name(&self) -> &str;

    /// Run until `ctx.shutdown` is cancelled or the source is exhausted
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot keep running
    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()>;
}

/// Consumes outbound envelopes
#[async_trait]
pub trait OutputModule: Send + Sync {
    fn name(&self) -> &str;

    /// Input modules whose responses this output renders; empty means all
    fn sources(&self) -> &[String] {
        &[]
    }

    /// Subscription filter
    fn accepts(&self, envelope: &Envelope) -> bool {
        envelope.kind == EnvelopeKind::OutboundText
            && (self.sources().is_empty()
                || envelope
                    .target
                    .as_ref()
                    .is_some_and(|t| self.sources().contains(t)))
    }

    /// Render one envelope
    ///
    /// # Errors
    ///
    /// Returns an error if rendering failed; the envelope is dropped
    async fn deliver(&self, envelope: &Envelope) -> Result<()>;

    async fn shutdown(&self) {}
}

/// Builds input modules of one type
pub trait InputFactory: Send + Sync {
    /// Check configuration without constructing anything
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` when the configuration is unusable
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    /// Construct the module
    ///
    /// # Errors
    ///
    /// Returns `Construction` or `ConfigValidation` on failure
    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Box<dyn InputModule>>;
}

/// Builds output modules of one type
pub trait OutputFactory: Send + Sync {
    /// Check configuration without constructing anything
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` when the configuration is unusable
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    /// Construct the module
    ///
    /// # Errors
    ///
    /// Returns `Construction` or `ConfigValidation` on failure
    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn OutputModule>>;
}

impl ModuleFactory for dyn InputFactory {
    type Module = Box<dyn InputModule>;

    fn check_config(&self, config: &ModuleConfig) -> Result<()> {
        self.validate_config(config)
    }

    fn construct(&self, name: &str, config: &ModuleConfig) -> Result<Self::Module> {
        self.build(name, config)
    }
}

impl ModuleFactory for dyn OutputFactory {
    type Module = Arc<dyn OutputModule>;

    fn check_config(&self, config: &ModuleConfig) -> Result<()> {
        self.validate_config(config)
    }

    fn construct(&self, name: &str, config: &ModuleConfig) -> Result<Self::Module> {
        self.build(name, config)
    }
}

/// Subscribe `output` to the bus with its own filter
///
/// # Errors
///
/// Returns `DuplicateName` if an output with the same name is subscribed
pub fn subscribe_output(bus: &MessageBus, output: &Arc<dyn OutputModule>) -> Result<Subscription> {
    let filter = Arc::clone(output);
    bus.subscribe(format!("output:{}", output.name()), move |e: &Envelope| {
        filter.accepts(e)
    })
}

/// Deliver envelopes from `subscription` until shutdown
///
/// Delivery errors are logged and the envelope dropped.
pub async fn run_output(
    output: Arc<dyn OutputModule>,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = shutdown.cancelled() => break,
            envelope = subscription.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        if let Err(e) = output.deliver(&envelope).await {
            tracing::warn!(output = output.name(), error = %e, "delivery failed");
        }
    }
    output.shutdown().await;
    tracing::debug!(output = output.name(), "output stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCallResult;

    struct Routed {
        sources: Vec<String>,
    }

    #[async_trait]
    impl OutputModule for Routed {
        fn name(&self) -> &str {
            "routed"
        }

        fn sources(&self) -> &[String] {
            &self.sources
        }

        async fn deliver(&self, _envelope: &Envelope) -> Result<()> {
            Ok(())
        }
    }

    fn response_to(origin: &str) -> Envelope {
        let inbound = Envelope::inbound(origin, "hi");
        Envelope::response("engine", &inbound, "hello", Vec::<ToolCallResult>::new())
    }

    #[test]
    fn test_accepts_all_without_sources() {
        let output = Routed { sources: vec![] };
        assert!(output.accepts(&response_to("terminal")));
        assert!(!output.accepts(&Envelope::inbound("terminal", "hi")));
    }

    #[test]
    fn test_accepts_only_listed_sources() {
        let output = Routed {
            sources: vec!["web".to_string()],
        };
        assert!(output.accepts(&response_to("web")));
        assert!(!output.accepts(&response_to("terminal")));
    }
}
