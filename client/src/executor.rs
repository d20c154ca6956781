//! Scheduled execution of discrete transport commands.
//!
//! A command's authoritative effect time is mapped onto the local clock
//! through the current clock estimate. Commands more than a few milliseconds
//! out are parked in a timer registry; everything else runs immediately,
//! including commands that arrive long after their effect time.

use crate::clock::ClockEstimate;
use crate::config::SyncConfig;
use crate::player::PlayerHandle;
use crate::timers::TimerRegistry;
use log::{debug, warn};
use shared::{SyncCommand, TimeSource};
use std::sync::Arc;

/// A command that has been applied to the player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiredCommand {
    pub command: SyncCommand,
    /// Server time the command took effect at
    pub effect_server_time_ms: i64,
    /// False when the player was already in the requested state
    pub player_touched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionOutcome {
    Scheduled { delay_ms: i64 },
    Executed(FiredCommand),
    ExecutedStale { late_ms: i64, fired: FiredCommand },
    /// Snapshots replace the anchor and are never executed here
    Ignored,
    PlayerUnavailable,
}

pub struct CommandExecutor {
    time: Arc<dyn TimeSource>,
    pending: TimerRegistry<SyncCommand>,
    schedule_ahead_threshold_ms: i64,
    stale_command_threshold_ms: i64,
    last_sequence: Option<u64>,
    stale_commands: u64,
}

impl CommandExecutor {
    pub fn new(config: &SyncConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            pending: TimerRegistry::new(),
            schedule_ahead_threshold_ms: config.schedule_ahead_threshold_ms,
            stale_command_threshold_ms: config.stale_command_threshold_ms,
            last_sequence: None,
            stale_commands: 0,
        }
    }

    pub fn execute_command(
        &mut self,
        command: SyncCommand,
        player: &mut dyn PlayerHandle,
        clock: &ClockEstimate,
    ) -> ExecutionOutcome {
        if let SyncCommand::StateSnapshot(_) = command {
            return ExecutionOutcome::Ignored;
        }

        self.track_sequence(&command);

        let now = self.time.now_ms();
        let Some(at_server_time) = command.effect_time_ms() else {
            let fired = Self::apply(command, clock.server_time_ms(now), player);
            return ExecutionOutcome::Executed(fired);
        };

        let local_target = at_server_time - clock.offset_ms;
        let delay_ms = local_target - now;

        if delay_ms > self.schedule_ahead_threshold_ms {
            debug!(
                "Scheduling {} #{} in {}ms",
                command.name(),
                command.sequence(),
                delay_ms
            );
            self.pending.schedule(local_target, command);
            return ExecutionOutcome::Scheduled { delay_ms };
        }

        let fired = Self::apply(command, at_server_time, player);

        if delay_ms <= -self.stale_command_threshold_ms {
            self.stale_commands += 1;
            warn!(
                "Stale {} #{} executed {}ms after its effect time",
                command.name(),
                command.sequence(),
                -delay_ms
            );
            return ExecutionOutcome::ExecutedStale {
                late_ms: -delay_ms,
                fired,
            };
        }

        ExecutionOutcome::Executed(fired)
    }

    /// Fires every scheduled command whose local deadline has passed.
    pub fn fire_due(&mut self, player: &mut dyn PlayerHandle) -> Vec<FiredCommand> {
        let now = self.time.now_ms();
        self.pending
            .take_due(now)
            .into_iter()
            .map(|(deadline, command)| {
                let effect = command.effect_time_ms().unwrap_or(deadline);
                debug!(
                    "Firing {} #{} ({}ms after deadline)",
                    command.name(),
                    command.sequence(),
                    now - deadline
                );
                Self::apply(command, effect, player)
            })
            .collect()
    }

    /// Drops every scheduled command. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.clear();
        if cancelled > 0 {
            debug!("Cancelled {} pending commands", cancelled);
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.pending.next_deadline()
    }

    pub fn stale_commands(&self) -> u64 {
        self.stale_commands
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    fn track_sequence(&mut self, command: &SyncCommand) {
        let sequence = command.sequence();
        match self.last_sequence {
            Some(last) if sequence == last => {
                warn!("Duplicate {} #{} received", command.name(), sequence);
            }
            Some(last) if sequence < last => {
                warn!(
                    "Out-of-order {} #{} received after #{}",
                    command.name(),
                    sequence,
                    last
                );
            }
            _ => {}
        }
        self.last_sequence = Some(self.last_sequence.map_or(sequence, |last| last.max(sequence)));
    }

    fn apply(
        command: SyncCommand,
        effect_server_time_ms: i64,
        player: &mut dyn PlayerHandle,
    ) -> FiredCommand {
        let player_touched = match command {
            SyncCommand::Play { .. } => {
                if player.is_playing() {
                    false
                } else {
                    player.play();
                    true
                }
            }
            SyncCommand::Pause { .. } => {
                if player.is_playing() {
                    player.pause();
                    true
                } else {
                    false
                }
            }
            SyncCommand::Seek {
                target_media_time_ms,
                ..
            } => {
                player.seek(target_media_time_ms);
                true
            }
            SyncCommand::SetRate { rate, .. } => {
                player.set_rate(rate);
                true
            }
            SyncCommand::StateSnapshot(_) => false,
        };

        FiredCommand {
            command,
            effect_server_time_ms,
            player_touched,
        }
    }
}
