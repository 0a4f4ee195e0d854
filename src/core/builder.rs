//! Builder for wiring a container before it starts.

use std::sync::Arc;

use crate::core::config::Config;
use crate::core::coordinator::Container;
use crate::core::queue::InputStrategy;
use crate::interceptors::Intercept;
use crate::machine::{EventHandler, Handler, Machine};

/// Assembles a [`Container`]: configuration, interceptors, and the
/// optional pre-attached event handler.
///
/// ## Example
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use stator::{ContainerBuilder, Handler, HandlerError, InputScope, InputStrategy, Machine};
/// # struct Counter;
/// # impl Machine for Counter {
/// #     type Input = i64;
/// #     type Event = String;
/// #     type State = i64;
/// # }
/// # struct Add;
/// # #[async_trait]
/// # impl Handler<Counter> for Add {
/// #     async fn handle(
/// #         &self,
/// #         scope: &mut InputScope<Counter>,
/// #         input: i64,
/// #     ) -> Result<(), HandlerError> {
/// #         scope.mutate(move |n| n + input).await?;
/// #         Ok(())
/// #     }
/// # }
/// # async fn demo() {
/// let container = ContainerBuilder::new()
///     .with_strategy(InputStrategy::Fifo)
///     .build(0i64, Arc::new(Add));
/// container.start().await.unwrap();
/// container.send_and_await(41).await.unwrap();
/// # }
/// ```
pub struct ContainerBuilder<M: Machine> {
    cfg: Config,
    interceptors: Vec<Arc<dyn Intercept<M>>>,
    event_handler: Option<Arc<dyn EventHandler<M>>>,
}

impl<M: Machine> Default for ContainerBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> ContainerBuilder<M> {
    pub fn new() -> Self {
        Self {
            cfg: Config::default(),
            interceptors: Vec::new(),
            event_handler: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, cfg: Config) -> Self {
        self.cfg = cfg;
        self
    }

    /// Sets the input ordering strategy, keeping the rest of the config.
    pub fn with_strategy(mut self, strategy: InputStrategy) -> Self {
        self.cfg.strategy = strategy;
        self
    }

    /// Adds a notification interceptor. Order of addition is preserved but
    /// carries no delivery guarantee between interceptors.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Intercept<M>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Pre-attaches the external event handler, so no event can slip by
    /// before a later `attach_event_handler` call.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler<M>>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Wires and spawns the container's actors. The result is `NotStarted`
    /// until [`Container::start`] is called.
    pub fn build(self, initial: M::State, handler: Arc<dyn Handler<M>>) -> Container<M> {
        Container::build(
            self.cfg,
            initial,
            handler,
            self.event_handler,
            self.interceptors,
        )
    }
}
