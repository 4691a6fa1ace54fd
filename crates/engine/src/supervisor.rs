//! Bot supervisor
//!
//! Owns the registry of live bot loops. Start, stop and pause are registry
//! operations: a bot id maps to at most one running task, and stop/pause
//! return only after that task has finished. The registry lock is never
//! held across a store call or a task join; a bot in the middle of a
//! transition is marked `Busy` instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::ExchangeConnector;
use crate::bot::{BotRunner, BotStore, EngineSettings};
use crate::error::ControlError;
use crate::types::BotStatus;
use crate::validator;

/// Reply to a control request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub bot_id: i64,
    pub status: BotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What to do with bots persisted as `running` when the process starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePolicy {
    Resume,
    MarkStopped,
}

struct BotHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Slot {
    Live(BotHandle),
    /// Starting or halting; other requests for the bot are rejected
    Busy,
}

pub struct BotSupervisor {
    store: Arc<dyn BotStore>,
    connector: Arc<dyn ExchangeConnector>,
    settings: EngineSettings,
    bots: Mutex<HashMap<i64, Slot>>,
}

impl BotSupervisor {
    pub fn new(
        store: Arc<dyn BotStore>,
        connector: Arc<dyn ExchangeConnector>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            connector,
            settings,
            bots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, bot_id: i64) -> ControlResponse {
        let result = self.try_start(bot_id).await;
        self.respond(bot_id, result).await
    }

    pub async fn stop(&self, bot_id: i64) -> ControlResponse {
        let result = self.halt(bot_id, BotStatus::Stopped).await;
        self.respond(bot_id, result).await
    }

    pub async fn pause(&self, bot_id: i64) -> ControlResponse {
        let result = self.halt(bot_id, BotStatus::Paused).await;
        self.respond(bot_id, result).await
    }

    /// Ids of bots with a live loop, ascending
    pub async fn active_bot_ids(&self) -> Vec<i64> {
        let bots = self.bots.lock().await;
        let mut ids: Vec<i64> = bots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(h) if !h.task.is_finished()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Bring persisted `running` bots in line with the (empty) registry
    pub async fn reconcile(&self, policy: ReconcilePolicy) -> Result<Vec<ControlResponse>, ControlError> {
        let running = self.store.bots_with_status(BotStatus::Running).await?;
        let mut responses = Vec::with_capacity(running.len());
        for bot_id in running {
            let response = match policy {
                ReconcilePolicy::Resume => self.start(bot_id).await,
                ReconcilePolicy::MarkStopped => {
                    let result = self
                        .store
                        .set_status(bot_id, BotStatus::Stopped)
                        .await
                        .map(|_| BotStatus::Stopped)
                        .map_err(ControlError::from);
                    self.respond(bot_id, result).await
                }
            };
            responses.push(response);
        }
        info!(bots = responses.len(), ?policy, "Reconciled persisted bots");
        Ok(responses)
    }

    /// Stop every loop, leaving persisted statuses untouched for the next
    /// reconcile
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, BotHandle)> = {
            let mut bots = self.bots.lock().await;
            let live: Vec<i64> = bots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(id, _)| *id)
                .collect();
            live.into_iter()
                .filter_map(|id| match bots.remove(&id) {
                    Some(Slot::Live(handle)) => Some((id, handle)),
                    _ => None,
                })
                .collect()
        };
        for (_, handle) in &handles {
            let _ = handle.cancel.send(true);
        }
        for (bot_id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(bot_id, error = %e, "Bot task ended abnormally during shutdown");
            }
        }
        info!("Supervisor shut down");
    }

    /// Claim the bot's slot for a transition. A finished loop is dropped.
    async fn claim(&self, bot_id: i64) -> Result<Option<BotHandle>, ControlError> {
        let mut bots = self.bots.lock().await;
        match bots.insert(bot_id, Slot::Busy) {
            None => Ok(None),
            Some(Slot::Live(handle)) => Ok(Some(handle)),
            Some(Slot::Busy) => Err(ControlError::Busy(bot_id)),
        }
    }

    async fn release(&self, bot_id: i64, slot: Option<Slot>) {
        let mut bots = self.bots.lock().await;
        match slot {
            Some(slot) => bots.insert(bot_id, slot),
            None => bots.remove(&bot_id),
        };
    }

    async fn try_start(&self, bot_id: i64) -> Result<BotStatus, ControlError> {
        let previous = self.claim(bot_id).await?;
        if let Some(handle) = previous {
            if !handle.task.is_finished() {
                self.release(bot_id, Some(Slot::Live(handle))).await;
                return Err(ControlError::AlreadyRunning(bot_id));
            }
        }

        match self.spawn(bot_id).await {
            Ok(handle) => {
                self.release(bot_id, Some(Slot::Live(handle))).await;
                Ok(BotStatus::Running)
            }
            Err(e) => {
                self.release(bot_id, None).await;
                Err(e)
            }
        }
    }

    async fn spawn(&self, bot_id: i64) -> Result<BotHandle, ControlError> {
        let bot = self.store.load_bot(bot_id).await?;
        let strategy = self.store.load_strategy(bot.strategy_id).await?;
        if let Err(violations) = validator::compile(&strategy.config) {
            return Err(ControlError::InvalidStrategy { bot_id, violations });
        }

        self.store.set_status(bot_id, BotStatus::Running).await?;
        if bot.last_error.is_some() || bot.fatal_error {
            self.store.clear_error(bot_id).await?;
        }

        let (cancel, rx) = watch::channel(false);
        let runner = BotRunner::new(
            bot_id,
            self.store.clone(),
            self.connector.clone(),
            self.settings.clone(),
        );
        let task = tokio::spawn(runner.run(rx));

        info!(bot_id, strategy_id = strategy.id, pair = %strategy.pair, "Bot started");
        Ok(BotHandle { cancel, task })
    }

    async fn halt(&self, bot_id: i64, target: BotStatus) -> Result<BotStatus, ControlError> {
        let Some(handle) = self.claim(bot_id).await? else {
            let result = self.halt_idle(bot_id, target).await;
            self.release(bot_id, None).await;
            return result;
        };

        let _ = handle.cancel.send(true);
        let joined = handle.task.await;
        let result = self.store.set_status(bot_id, target).await;
        self.release(bot_id, None).await;
        result?;
        info!(bot_id, status = %target, "Bot halted");
        if joined.is_err() {
            return Err(ControlError::TaskFailed(bot_id));
        }
        Ok(target)
    }

    /// Stop or pause a bot that has no loop
    async fn halt_idle(&self, bot_id: i64, target: BotStatus) -> Result<BotStatus, ControlError> {
        let bot = self.store.load_bot(bot_id).await?;
        match (bot.status, target) {
            (s, t) if s == t => Ok(s),
            // A paused bot, or one persisted as live without a loop
            (BotStatus::Paused | BotStatus::Running | BotStatus::Error, BotStatus::Stopped) => {
                self.store.set_status(bot_id, target).await?;
                Ok(target)
            }
            _ => Err(ControlError::NotRunning(bot_id)),
        }
    }

    async fn respond(
        &self,
        bot_id: i64,
        result: Result<BotStatus, ControlError>,
    ) -> ControlResponse {
        match result {
            Ok(status) => ControlResponse {
                bot_id,
                status,
                error: None,
            },
            Err(e) => {
                warn!(bot_id, error = %e, "Bot control request rejected");
                let status = match self.store.load_bot(bot_id).await {
                    Ok(bot) => bot.status,
                    Err(load_err) => {
                        error!(bot_id, error = %load_err, "Failed to load bot status");
                        BotStatus::Idle
                    }
                };
                ControlResponse {
                    bot_id,
                    status,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
