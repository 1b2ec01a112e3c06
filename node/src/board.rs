use relaynode_common::Level;

pub const BUTTON_GPIO: u8 = 22;

/// GPIO and active level of every output channel, in wiring order.
///
/// GPIO25 is the broker-controlled channel and is wired active-low.
pub const OUTPUTS: [(u8, Level); 8] = [
    (16, Level::High),
    (17, Level::High),
    (18, Level::High),
    (19, Level::High),
    (25, Level::Low),
    (26, Level::High),
    (32, Level::High),
    (33, Level::High),
];

pub const REMOTE_OUTPUT_GPIO: u8 = 25;

pub fn remote_output_index() -> usize {
    OUTPUTS
        .iter()
        .position(|(gpio, _)| *gpio == REMOTE_OUTPUT_GPIO)
        .unwrap_or(0)
}

/// Builds one driver per output channel, paired with its active level.
pub fn output_channels<P, E>(
    mut open: impl FnMut(u8) -> Result<P, E>,
) -> Result<Vec<(P, Level)>, E> {
    OUTPUTS
        .iter()
        .map(|&(gpio, active)| open(gpio).map(|pin| (pin, active)))
        .collect()
}
