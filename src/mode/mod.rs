//! Mode selection and fallback.
//!
//! One [`ModeController`] per session owns the live pipeline slot. Realtime
//! sessions that cannot reach their provider degrade to a cascade pipeline,
//! at session start or at the next turn boundary, and the conversation
//! history crosses the switch intact.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::GatewayResult;
use crate::pipeline::vad::VadConfig;
use crate::pipeline::{CascadePipeline, PipelineEvent, RealtimePipeline, VoicePipeline};
use crate::providers::{self, ChatTurn, ProviderContext};
use crate::session::types::{SessionMode, SessionProviderConfig};

/// Per-session provider defaults, taken from the server configuration.
#[derive(Debug, Clone)]
pub struct ModeDefaults {
    pub realtime_provider: String,
    pub stt_provider: String,
    pub llm_provider: String,
    pub tts_provider: String,
    pub stage_timeout: Duration,
    pub vad: VadConfig,
}

impl ModeDefaults {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            realtime_provider: config.default_realtime_provider.clone(),
            stt_provider: config.default_stt_provider.clone(),
            llm_provider: config.default_llm_provider.clone(),
            tts_provider: config.default_tts_provider.clone(),
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            vad: VadConfig {
                energy_threshold: config.vad_energy_threshold,
                min_speech_ms: config.vad_min_speech_ms,
                min_silence_ms: config.vad_min_silence_ms,
            },
        }
    }
}

/// Outcome of building the initial pipeline.
pub struct InitialPipeline {
    /// Mode the session actually starts in
    pub mode: SessionMode,
    /// Set when a realtime request degraded to cascade at connect time
    pub fell_back: bool,
}

/// Owns the pipeline slot for one session and performs mode switches.
pub struct ModeController {
    ctx: ProviderContext,
    defaults: ModeDefaults,
    user_id: String,
    config: SessionProviderConfig,
    system_prompt: String,
    events: mpsc::Sender<PipelineEvent>,
    history: Arc<Mutex<Vec<ChatTurn>>>,
    pipeline: ArcSwap<Box<dyn VoicePipeline>>,
}

/// Placeholder occupying the slot before the first real pipeline lands.
struct IdlePipeline;

#[async_trait::async_trait]
impl VoicePipeline for IdlePipeline {
    fn mode(&self) -> SessionMode {
        SessionMode::Cascade
    }
    async fn push_audio(&self, _frame: bytes::Bytes) -> Result<(), providers::ProviderError> {
        Ok(())
    }
    async fn end_turn(&self) -> Result<(), providers::ProviderError> {
        Ok(())
    }
    async fn cancel_response(&self) -> Result<(), providers::ProviderError> {
        Ok(())
    }
    async fn shutdown(&self) {}
}

impl ModeController {
    pub fn new(
        ctx: ProviderContext,
        defaults: ModeDefaults,
        user_id: String,
        config: SessionProviderConfig,
        system_prompt: String,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            ctx,
            defaults,
            user_id,
            config,
            system_prompt,
            events,
            history: Arc::new(Mutex::new(Vec::new())),
            pipeline: ArcSwap::from_pointee(Box::new(IdlePipeline) as Box<dyn VoicePipeline>),
        }
    }

    /// The currently live pipeline.
    pub fn current(&self) -> Arc<Box<dyn VoicePipeline>> {
        self.pipeline.load_full()
    }

    /// Conversation history shared across mode switches.
    pub fn history(&self) -> Arc<Mutex<Vec<ChatTurn>>> {
        Arc::clone(&self.history)
    }

    /// Build and install the initial pipeline. A realtime connect failure
    /// degrades to cascade instead of failing the session, provided the
    /// cascade stages themselves can be built.
    pub async fn start(&self, requested: SessionMode) -> GatewayResult<InitialPipeline> {
        match requested {
            SessionMode::Cascade => {
                let pipeline = self.build_cascade()?;
                self.pipeline.store(pipeline);
                Ok(InitialPipeline {
                    mode: SessionMode::Cascade,
                    fell_back: false,
                })
            }
            SessionMode::Realtime => match self.build_realtime().await {
                Ok(pipeline) => {
                    self.pipeline.store(pipeline);
                    Ok(InitialPipeline {
                        mode: SessionMode::Realtime,
                        fell_back: false,
                    })
                }
                Err(error) => {
                    warn!(%error, "realtime connect failed, degrading to cascade");
                    let pipeline = self.build_cascade()?;
                    self.pipeline.store(pipeline);
                    Ok(InitialPipeline {
                        mode: SessionMode::Cascade,
                        fell_back: true,
                    })
                }
            },
        }
    }

    /// Replace a failed realtime pipeline with a cascade one. Called at a
    /// turn boundary; the old pipeline is shut down after the swap so no
    /// event gap opens up.
    pub async fn fall_back(&self) -> GatewayResult<()> {
        let cascade = self.build_cascade()?;
        let previous = self.pipeline.swap(cascade);
        previous.shutdown().await;
        info!("session degraded from realtime to cascade");
        Ok(())
    }

    /// Tear down whichever pipeline is live.
    pub async fn shutdown(&self) {
        self.current().shutdown().await;
    }

    async fn build_realtime(&self) -> GatewayResult<Arc<Box<dyn VoicePipeline>>> {
        let provider_name = self
            .config
            .provider
            .as_deref()
            .unwrap_or(&self.defaults.realtime_provider);
        let provider = providers::create_realtime(
            &self.ctx,
            &self.user_id,
            provider_name,
            self.config.model.as_deref(),
            self.config.voice.as_deref(),
            Some(&self.system_prompt),
        )?;
        let pipeline = RealtimePipeline::connect(provider, self.events.clone())
            .await
            .map_err(crate::errors::GatewayError::from)?;
        let boxed: Box<dyn VoicePipeline> = Box::new(pipeline);
        Ok(Arc::new(boxed))
    }

    fn build_cascade(&self) -> GatewayResult<Arc<Box<dyn VoicePipeline>>> {
        let stt = providers::create_stt(
            &self.ctx,
            &self.user_id,
            self.config
                .stt_provider
                .as_deref()
                .unwrap_or(&self.defaults.stt_provider),
            None,
        )?;
        let llm = providers::create_llm(
            &self.ctx,
            &self.user_id,
            self.config
                .llm_provider
                .as_deref()
                .unwrap_or(&self.defaults.llm_provider),
            self.config.llm_model.as_deref(),
        )?;
        let tts = providers::create_tts(
            &self.ctx,
            &self.user_id,
            self.config
                .tts_provider
                .as_deref()
                .unwrap_or(&self.defaults.tts_provider),
            self.config.tts_voice.as_deref(),
        )?;
        let boxed: Box<dyn VoicePipeline> = Box::new(CascadePipeline::new(
            stt,
            llm,
            tts,
            self.events.clone(),
            self.system_prompt.clone(),
            Arc::clone(&self.history),
            self.defaults.stage_timeout,
            self.defaults.vad.clone(),
        ));
        Ok(Arc::new(boxed))
    }
}

/// Compose the system prompt from the scenario description and role labels.
pub fn build_system_prompt(
    base_prompt: Option<&str>,
    user_role: &str,
    ai_role: &str,
    scenario_context: Option<&str>,
) -> String {
    let mut prompt = base_prompt
        .map(str::to_string)
        .unwrap_or_else(|| format!("You are a {ai_role} having a voice conversation."));
    prompt.push_str(&format!(
        " You are speaking with a {user_role}. Keep responses short and conversational; they will be spoken aloud."
    ));
    if let Some(context) = scenario_context {
        prompt.push_str("\n\nScenario: ");
        prompt.push_str(context);
    }
    prompt
}
