//! Session registry and lifecycle.
//!
//! At most one active session per user. Starting a new one displaces the old
//! atomically: the old session's status turns terminal before the new
//! session's handle becomes visible, so there is never a moment with two
//! active sessions for the same user.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::barge_in::BargeInController;
use crate::config::ServerConfig;
use crate::errors::GatewayResult;
use crate::mode::{ModeController, ModeDefaults, build_system_prompt};
use crate::protocol::messages::{MessageRoute, ServerMessage};
use crate::providers::{CredentialStore, ProviderContext};
use crate::session::runner::{SessionCommand, SessionRunner};
use crate::session::types::{
    Session, SessionMode, SessionProviderConfig, SessionStatus, epoch_millis,
};

/// Commands channel depth per session. Audio frames arrive at most 20/sec,
/// so this is minutes of headroom.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Pipeline event channel depth per session.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default participant labels when the session config does not set them.
const DEFAULT_USER_ROLE: &str = "user";
const DEFAULT_AI_ROLE: &str = "assistant";

/// Parameters of a `start_session` request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub mode: SessionMode,
    pub config: SessionProviderConfig,
    pub system_prompt: Option<String>,
    pub barge_in_enabled: bool,
}

/// Control handle for one live session.
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    session: Arc<Mutex<Session>>,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Forward a client command to the runner. Errors mean the runner is
    /// gone; callers treat the session as over.
    pub async fn command(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.lock().status
    }

    pub fn mode(&self) -> SessionMode {
        self.session.lock().mode
    }

    /// Move the session to a terminal status and stop the runner. The status
    /// write happens before the cancel, so an observer never sees the runner
    /// die while the session still reads as active.
    pub fn terminate(&self, status: SessionStatus) {
        {
            let mut session = self.session.lock();
            if !session.status.is_terminal() {
                session.status = status;
                session.ended_at = Some(epoch_millis());
            }
        }
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registry of live sessions, keyed by user id.
pub struct SessionManager {
    ctx: ProviderContext,
    defaults: ModeDefaults,
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionManager {
    pub fn new(config: &ServerConfig) -> Self {
        let credentials = Arc::new(CredentialStore::new(config.system_credentials()));
        let ctx = ProviderContext {
            http: reqwest::Client::new(),
            credentials,
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
        };
        Self {
            ctx,
            defaults: ModeDefaults::from_config(config),
            sessions: DashMap::new(),
        }
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        Arc::clone(&self.ctx.credentials)
    }

    /// Start a session, displacing any active one for the same user, and
    /// spawn its runner. Emits `session_started` (and a recoverable error
    /// first if realtime degraded at connect time) on `outbound`.
    pub async fn start_session(
        &self,
        request: SessionRequest,
        outbound: mpsc::Sender<MessageRoute>,
    ) -> GatewayResult<Arc<SessionHandle>> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let user_role = request
            .config
            .user_role
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_ROLE.to_string());
        let ai_role = request
            .config
            .ai_role
            .clone()
            .unwrap_or_else(|| DEFAULT_AI_ROLE.to_string());
        let system_prompt = build_system_prompt(
            request.system_prompt.as_deref(),
            &user_role,
            &ai_role,
            request.config.scenario_context.as_deref(),
        );

        let controller = Arc::new(ModeController::new(
            self.ctx.clone(),
            self.defaults.clone(),
            request.user_id.clone(),
            request.config.clone(),
            system_prompt,
            events_tx,
        ));

        // build the pipeline before touching the registry, so a failed start
        // leaves any existing session untouched
        let started = controller.start(request.mode).await?;

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(Session {
            id: session_id.clone(),
            user_id: request.user_id.clone(),
            mode: started.mode,
            config: request.config.clone(),
            user_role,
            ai_role,
            scenario_context: request.config.scenario_context.clone(),
            barge_in_enabled: request.barge_in_enabled,
            status: SessionStatus::Active,
            started_at: epoch_millis(),
            ended_at: None,
            turns: Vec::new(),
        }));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = Arc::new(SessionHandle {
            id: session_id.clone(),
            user_id: request.user_id.clone(),
            session: Arc::clone(&session),
            commands: commands_tx,
            cancel: cancel.clone(),
        });

        // displace before publishing the new handle
        if let Some(previous) = self.sessions.insert(request.user_id.clone(), Arc::clone(&handle))
        {
            info!(
                session_id = previous.id,
                user_id = request.user_id,
                "displacing active session"
            );
            previous.terminate(SessionStatus::Disconnected);
        }

        if started.fell_back {
            let _ = outbound
                .send(MessageRoute::Outgoing(ServerMessage::Error {
                    code: crate::errors::ErrorCode::ProviderError,
                    message: "realtime provider unavailable, continuing in cascade mode"
                        .to_string(),
                    recoverable: true,
                    details: None,
                }))
                .await;
        }
        let _ = outbound
            .send(MessageRoute::Outgoing(ServerMessage::SessionStarted {
                session_id: session_id.clone(),
                mode: started.mode,
                config: request.config,
            }))
            .await;

        let runner = SessionRunner::new(
            session,
            controller,
            BargeInController::new(request.barge_in_enabled),
            outbound,
            commands_rx,
            events_rx,
            cancel,
        );
        tokio::spawn(runner.run());

        info!(session_id, user_id = request.user_id, mode = %started.mode, "session started");
        Ok(handle)
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(user_id).map(|entry| Arc::clone(&entry))
    }

    /// Drop the registry entry if it still refers to this handle.
    pub fn remove(&self, handle: &SessionHandle) {
        self.sessions
            .remove_if(&handle.user_id, |_, current| current.id == handle.id);
        debug!(session_id = handle.id, "session removed from registry");
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Terminate every session; used during graceful shutdown.
    pub fn terminate_all(&self, status: SessionStatus) {
        for entry in self.sessions.iter() {
            entry.value().terminate(status);
        }
        self.sessions.clear();
    }
}
