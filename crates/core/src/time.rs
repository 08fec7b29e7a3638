use crate::config::TimeBaseConfig;
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Gamestate received, waiting for the first snapshot.
    Priming,
    Active,
}

/// Which correction [`TimeBase::adjust`] applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAdjustment {
    Reset,
    Fast,
    Drift,
    /// Inside the drift band but a timescale modifier is active.
    Held,
}

/// Maps local wall-clock milliseconds onto the server's simulation clock.
///
/// Corrections only happen when a new snapshot has arrived, so a burst of
/// packet loss cannot produce one huge adjustment. The output of
/// [`TimeBase::advance`] never decreases.
#[derive(Debug, Clone)]
pub struct TimeBase {
    config: TimeBaseConfig,
    state: ConnectionState,
    delta: i32,
    server_time: i32,
    old_server_time: i32,
    frame_server_time: i32,
    old_frame_server_time: i32,
    extrapolated: bool,
    new_snapshots: bool,
    paused: bool,
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new(TimeBaseConfig::default())
    }
}

impl TimeBase {
    pub fn new(config: TimeBaseConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            delta: 0,
            server_time: 0,
            old_server_time: i32::MIN,
            frame_server_time: 0,
            old_frame_server_time: i32::MIN,
            extrapolated: false,
            new_snapshots: false,
            paused: false,
        }
    }

    pub fn config(&self) -> &TimeBaseConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TimeBaseConfig {
        &mut self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn delta(&self) -> i32 {
        self.delta
    }

    /// Last time handed out by [`TimeBase::advance`].
    pub fn server_time(&self) -> i32 {
        self.server_time
    }

    pub fn is_extrapolated(&self) -> bool {
        self.extrapolated
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// A fresh gamestate arrived; wait for its first snapshot. The output
    /// floor survives so a reconnect never runs the clock backwards.
    pub fn prime(&mut self) {
        let floor = self.old_server_time;
        *self = Self {
            old_server_time: floor,
            ..Self::new(self.config.clone())
        };
        self.state = ConnectionState::Priming;
    }

    pub fn disconnect(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Records the server time of a newly parsed frame.
    pub fn snapshot_arrived(&mut self, frame_server_time: i32) {
        self.frame_server_time = frame_server_time;
        self.new_snapshots = true;
    }

    /// Computes the simulation time for `real_time`. `Ok(None)` until the
    /// first snapshot has been seen.
    pub fn advance(&mut self, real_time: i32) -> Result<Option<i32>, ProtocolError> {
        match self.state {
            ConnectionState::Disconnected => return Ok(None),
            ConnectionState::Priming => {
                if !self.new_snapshots {
                    return Ok(None);
                }
                self.new_snapshots = false;
                self.first_snapshot(real_time);
            }
            ConnectionState::Active => {}
        }

        if self.paused {
            return Ok(Some(self.server_time));
        }

        if self.frame_server_time < self.old_frame_server_time {
            return Err(ProtocolError::FrameTimeWentBackwards {
                time: self.frame_server_time,
                previous: self.old_frame_server_time,
            });
        }
        self.old_frame_server_time = self.frame_server_time;

        let unnudged = real_time.wrapping_add(self.delta);
        self.server_time = unnudged
            .wrapping_sub(self.config.time_nudge_ms)
            .max(self.old_server_time);
        self.old_server_time = self.server_time;

        if unnudged >= self.frame_server_time.saturating_sub(self.config.extrapolation_lead_ms) {
            self.extrapolated = true;
        }

        if self.new_snapshots {
            self.adjust(real_time);
        }

        Ok(Some(self.server_time))
    }

    fn first_snapshot(&mut self, real_time: i32) {
        log::info!("first snapshot at server time {}", self.frame_server_time);
        self.state = ConnectionState::Active;
        self.delta = self.frame_server_time.wrapping_sub(real_time);
        self.old_server_time = self.old_server_time.max(self.frame_server_time);
    }

    /// Steers the delta towards the newest frame. Normally driven by
    /// [`TimeBase::advance`] whenever snapshots arrived since the last call.
    pub fn adjust(&mut self, real_time: i32) -> TimeAdjustment {
        self.new_snapshots = false;

        let new_delta = self.frame_server_time.wrapping_sub(real_time);
        let diff = new_delta.wrapping_sub(self.delta).unsigned_abs();

        let adjustment = if diff > self.config.reset_threshold_ms as u32 {
            self.delta = new_delta;
            self.old_server_time = self.old_server_time.max(self.frame_server_time);
            self.server_time = self.old_server_time;
            TimeAdjustment::Reset
        } else if diff > self.config.fast_threshold_ms as u32 {
            self.delta = ((self.delta as i64 + new_delta as i64) >> 1) as i32;
            TimeAdjustment::Fast
        } else if self.config.timescale == 0.0 || self.config.timescale == 1.0 {
            if self.extrapolated {
                self.extrapolated = false;
                self.delta -= 2;
            } else {
                self.delta += 1;
            }
            TimeAdjustment::Drift
        } else {
            TimeAdjustment::Held
        };

        if self.config.show_time_delta {
            match adjustment {
                TimeAdjustment::Reset => log::debug!("<RESET> {}", self.delta),
                TimeAdjustment::Fast => log::debug!("<FAST> {}", self.delta),
                _ => log::debug!("{}", self.delta),
            }
        }

        adjustment
    }
}
