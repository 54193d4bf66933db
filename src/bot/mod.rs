//! # Bot Module
//!
//! Gateway glue for the playback engine. Commands are not handled here;
//! this only reacts to the events that affect playback itself:
//!
//! - `ready`: rejoin every restored voice channel and restart its loop
//! - `voice_state_update`: notice when the bot was disconnected from voice

use serenity::{
    all::{Context, EventHandler, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::info;

use crate::audio::Player;

pub struct TunesBot {
    player: Arc<Player>,
    /// Ready fires again after every gateway reconnect; resume only once.
    resumed: AtomicBool,
}

impl TunesBot {
    pub fn new(player: Arc<Player>) -> Self {
        Self {
            player,
            resumed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for TunesBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online in {} guilds", ready.user.name, ready.guilds.len());

        if self.resumed.swap(true, Ordering::AcqRel) {
            return;
        }

        let player = self.player.clone();
        tokio::spawn(async move {
            let playing = player.resume_all().await;
            info!("🔁 Resumed playback in {} guilds", playing);
        });
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id {
            return;
        }

        if old.is_some() && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Disconnected from voice in guild {}", guild_id);
                self.player.voice_lost(guild_id);
            }
        }
    }
}
