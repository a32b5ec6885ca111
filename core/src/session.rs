//! Scope object for one open conversation view.

use std::collections::HashMap;
use std::sync::Arc;

use chat_api::Message;
use parking_lot::Mutex;
use tokio::time::Duration;
use tracing::info;

use crate::audio::{
    FrameClock, Microphone, PlaybackBackend, PlayerSettings, RecorderSettings, VoicePlayer,
    VoiceRecorder,
};
use crate::context::UserContext;
use crate::recipients::{RecipientResolver, DEFAULT_DEBOUNCE};
use crate::sync::{SyncEngine, SyncSettings};
use crate::transport::ConversationTransport;

/// Platform audio devices for a session.
#[derive(Clone)]
pub struct Devices {
    pub backend: Arc<dyn PlaybackBackend>,
    pub clock: Arc<dyn FrameClock>,
    pub microphone: Arc<dyn Microphone>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub sync: SyncSettings,
    pub recorder: RecorderSettings,
    pub player: PlayerSettings,
    pub debounce: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            recorder: RecorderSettings::default(),
            player: PlayerSettings::default(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Owns every task, device and handle a conversation view uses. Closing the
/// session (or dropping it) stops all of them.
pub struct ViewSession {
    transport: Arc<dyn ConversationTransport>,
    devices: Devices,
    settings: SessionSettings,
    engine: SyncEngine,
    resolver: RecipientResolver,
    recorder: VoiceRecorder,
    players: Mutex<HashMap<String, VoicePlayer>>,
}

impl ViewSession {
    /// Build the session components and start the conversation list task.
    pub fn open(
        transport: Arc<dyn ConversationTransport>,
        user: UserContext,
        devices: Devices,
        settings: SessionSettings,
    ) -> Self {
        info!(user = %user.user_id, "opening view session");
        let engine = SyncEngine::new(transport.clone(), user, settings.sync);
        let resolver = RecipientResolver::with_debounce(transport.clone(), settings.debounce);
        let recorder = VoiceRecorder::new(
            devices.microphone.clone(),
            Arc::new(engine.clone()),
            settings.recorder,
        );
        engine.start();
        Self {
            transport,
            devices,
            settings,
            engine,
            resolver,
            recorder,
            players: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn resolver(&self) -> &RecipientResolver {
        &self.resolver
    }

    pub fn recorder(&self) -> &VoiceRecorder {
        &self.recorder
    }

    /// Player for a voice message, created on first use. `None` for
    /// messages without a playable attachment.
    pub fn player(&self, message: &Message) -> Option<VoicePlayer> {
        let attachment = message.audio.as_ref().filter(|a| !a.url.is_empty())?;
        let mut players = self.players.lock();
        let player = players.entry(message.id.clone()).or_insert_with(|| {
            VoicePlayer::new(
                self.transport.clone(),
                self.devices.backend.clone(),
                self.devices.clock.clone(),
                attachment.clone(),
                self.settings.player,
            )
        });
        Some(player.clone())
    }

    /// Switch the active conversation. Leaving a conversation cancels an
    /// ongoing recording and releases every player of its messages.
    pub async fn set_active_conversation(&self, id: Option<String>) {
        if self.engine.active_conversation() != id {
            self.recorder.cancel();
            self.release_players();
        }
        self.engine.set_active_conversation(id).await;
    }

    /// Tear down and forget the player of a message that left the view.
    pub fn release_player(&self, message_id: &str) {
        if let Some(player) = self.players.lock().remove(message_id) {
            player.teardown();
        }
    }

    /// Stop polling, resolving and recording, and release every player.
    pub fn close(&self) {
        self.engine.shutdown();
        self.resolver.close();
        self.recorder.cancel();
        let players = self.release_players();
        info!(players, "view session closed");
    }

    fn release_players(&self) -> usize {
        let players: Vec<VoicePlayer> = self.players.lock().drain().map(|(_, p)| p).collect();
        for player in &players {
            player.teardown();
        }
        players.len()
    }
}

impl Drop for ViewSession {
    fn drop(&mut self) {
        self.close();
    }
}
