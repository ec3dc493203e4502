//! Named handler factories for assembling pipelines from configuration.

use crate::config::{HandlerConfig, PipelineConfig};
use crate::handler::{
    FEEDBACK_GENERATION_HANDLER_NAME, FeedbackGenerationHandlerBuilder,
    LAYER_FILTER_HANDLER_NAME, LayerFilterHandlerBuilder, PADDING_GENERATOR_HANDLER_NAME,
    PLI_PACER_HANDLER_NAME, PaddingGeneratorHandlerBuilder, PliPacerHandlerBuilder,
    RTP_RETRANSMISSION_HANDLER_NAME, RtpRetransmissionHandlerBuilder, STATS_HANDLER_NAME,
    StatsHandler,
};
use crate::pipeline::{Handler, Pipeline};
use log::debug;
use shared::error::{Error, Result};
use std::collections::HashMap;

/// Builds one handler from the shared settings.
pub type HandlerFactory = Box<dyn Fn(&HandlerConfig) -> Box<dyn Handler>>;

/// Maps handler names to factories.
///
/// # Example
///
/// ```ignore
/// use sfu_relay::{HandlerRegistry, PipelineConfig};
///
/// let registry = HandlerRegistry::with_defaults()
///     .with("my-handler", |_config| Box::new(MyHandler::new()));
/// let pipeline = registry.build_pipeline(&PipelineConfig {
///     handlers: vec!["stats".into(), "my-handler".into()],
///     ..Default::default()
/// })?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in handler.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(STATS_HANDLER_NAME, |_| Box::new(StatsHandler::new()))
            .with(FEEDBACK_GENERATION_HANDLER_NAME, |config| {
                let mut builder = FeedbackGenerationHandlerBuilder::new()
                    .with_nacks_enabled(config.nacks_enabled)
                    .with_nack_policy(config.nack_policy)
                    .with_video_interval(config.rtcp_video_interval())
                    .with_audio_interval(config.rtcp_audio_interval());
                if let Some(sender_ssrc) = config.sender_ssrc {
                    builder = builder.with_sender_ssrc(sender_ssrc);
                }
                Box::new(builder.build())
            })
            .with(PLI_PACER_HANDLER_NAME, |config| {
                Box::new(
                    PliPacerHandlerBuilder::new()
                        .with_pli_period(config.pli_period())
                        .with_keyframe_timeout(config.keyframe_timeout())
                        .build(),
                )
            })
            .with(LAYER_FILTER_HANDLER_NAME, |config| {
                Box::new(
                    LayerFilterHandlerBuilder::new()
                        .with_switch_timeout(config.layer_switch_timeout())
                        .build(),
                )
            })
            .with(PADDING_GENERATOR_HANDLER_NAME, |config| {
                Box::new(
                    PaddingGeneratorHandlerBuilder::new()
                        .with_enabled(config.padding_enabled)
                        .with_padding_packets(config.padding_packets)
                        .build(),
                )
            })
            .with(RTP_RETRANSMISSION_HANDLER_NAME, |config| {
                Box::new(
                    RtpRetransmissionHandlerBuilder::new()
                        .with_buffer_size(config.retransmission_buffer_size)
                        .build(),
                )
            })
    }

    /// Adds or replaces the factory for `name`.
    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&HandlerConfig) -> Box<dyn Handler> + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&HandlerConfig) -> Box<dyn Handler> + 'static,
    {
        self.factories.insert(name.to_owned(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str, config: &HandlerConfig) -> Result<Box<dyn Handler>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::ErrUnknownHandler(name.to_owned()))?;
        Ok(factory(config))
    }

    /// Instantiates `config.handlers` head to tail and finalizes the pipeline.
    ///
    /// Services are not registered; register them on the returned pipeline and
    /// call [`Pipeline::notify_update`].
    pub fn build_pipeline(&self, config: &PipelineConfig) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        for name in &config.handlers {
            pipeline.add_back(self.create(name, &config.handler)?);
        }
        pipeline.finalize();
        debug!("pipeline built with {:?}", pipeline.names());
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DataPacket;
    use crate::pipeline::HandlerContext;

    struct Named(&'static str);

    impl Handler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
            ctx.fire_read(packet);
            Ok(())
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                "layer-filter",
                "padding-generator",
                "pli-pacer",
                "rtcp-feedback-generation",
                "rtp-retransmission",
                "stats"
            ]
        );
    }

    #[test]
    fn test_build_pipeline_in_order() {
        let registry =
            HandlerRegistry::with_defaults().with("custom", |_| Box::new(Named("custom")));
        let pipeline = registry
            .build_pipeline(&PipelineConfig {
                handlers: vec!["custom".into(), "stats".into(), "pli-pacer".into()],
                ..Default::default()
            })
            .unwrap();
        assert!(pipeline.is_finalized());
        assert_eq!(pipeline.names(), vec!["custom", "stats", "pli-pacer"]);
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        let result = registry.build_pipeline(&PipelineConfig {
            handlers: vec!["missing".into()],
            ..Default::default()
        });
        assert_eq!(
            result.err(),
            Some(Error::ErrUnknownHandler("missing".to_owned()))
        );
    }

    #[test]
    fn test_factory_replaced() {
        let mut registry = HandlerRegistry::with_defaults();
        registry.register("stats", |_| Box::new(Named("quiet-stats")));
        let handler = registry.create("stats", &HandlerConfig::default()).unwrap();
        assert_eq!(handler.name(), "quiet-stats");
    }
}
