use tracing::{debug, info};

use crate::types::{Edge, Level};

pub trait DigitalInput {
    fn read(&mut self) -> Level;
}

pub trait DigitalOutput {
    fn write(&mut self, level: Level);
}

struct OutputChannel<P> {
    pin: P,
    active: Level,
    level: Level,
}

/// Output channels plus the one that answers broker commands.
///
/// Local input drives raw levels on every channel. Broker commands drive only
/// the remote channel, through its own active level, so an active-low remote
/// channel goes LOW on `'1'`. Whichever writer ran last wins.
pub struct OutputBank<P> {
    channels: Vec<OutputChannel<P>>,
    remote: usize,
}

impl<P: DigitalOutput> OutputBank<P> {
    /// `channels` pairs each pin with its active level. `remote` indexes the
    /// broker-controlled channel and falls back to the first one when out of range.
    pub fn new(channels: Vec<(P, Level)>, remote: usize) -> Self {
        let remote = if remote < channels.len() { remote } else { 0 };
        Self {
            channels: channels
                .into_iter()
                .map(|(pin, active)| OutputChannel {
                    pin,
                    active,
                    level: Level::Low,
                })
                .collect(),
            remote,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn drive_all(&mut self, level: Level) {
        for channel in &mut self.channels {
            channel.pin.write(level);
            channel.level = level;
        }
    }

    pub fn set_remote_active(&mut self, active: bool) {
        let Some(channel) = self.channels.get_mut(self.remote) else {
            return;
        };
        let level = match (active, channel.active) {
            (true, level) => level,
            (false, Level::High) => Level::Low,
            (false, Level::Low) => Level::High,
        };
        channel.pin.write(level);
        channel.level = level;
        debug!(
            "remote output {} -> {}",
            if active { "active" } else { "inactive" },
            level.as_str()
        );
    }

    pub fn levels(&self) -> Vec<Level> {
        self.channels.iter().map(|channel| channel.level).collect()
    }

    pub fn remote_level(&self) -> Option<Level> {
        self.channels.get(self.remote).map(|channel| channel.level)
    }
}

/// Edge-triggered mirror of the local input onto every output.
/// No debounce beyond the control loop's own pacing.
pub struct InputOutputMonitor<I> {
    input: I,
    previous: Level,
}

impl<I: DigitalInput> InputOutputMonitor<I> {
    pub fn new(input: I) -> Self {
        Self {
            input,
            previous: Level::Low,
        }
    }

    pub fn sample<P: DigitalOutput>(&mut self, outputs: &mut OutputBank<P>) -> Option<Edge> {
        let level = self.input.read();
        let edge = match (self.previous, level) {
            (Level::Low, Level::High) => Some(Edge::Rising),
            (Level::High, Level::Low) => Some(Edge::Falling),
            _ => None,
        };
        self.previous = level;

        match edge {
            Some(Edge::Rising) => {
                info!("button pressed");
                outputs.drive_all(Level::High);
            }
            Some(Edge::Falling) => {
                info!("button released");
                outputs.drive_all(Level::Low);
            }
            None => {}
        }
        edge
    }

    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }
}
