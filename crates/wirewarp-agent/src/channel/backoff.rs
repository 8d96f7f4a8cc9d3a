//! Reconnect delays.

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_secs(1);
const MAX: Duration = Duration::from_secs(60);
/// Jitter is uniform in ±25% of the capped delay.
const JITTER: f64 = 0.25;
/// Nothing to authenticate with: retrying sooner cannot help.
pub const NO_CREDENTIAL_WAIT: Duration = Duration::from_secs(5 * 60);

/// A session that stayed up at least this long restarts the backoff ladder.
pub const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Attempt counter to carry on with after a session that was up for `uptime`.
pub fn after_session(attempt: u32, uptime: Duration) -> u32 {
    if uptime >= STABLE_SESSION {
        0
    } else {
        attempt
    }
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn delay(attempt: u32, has_credentials: bool) -> Duration {
    delay_with_rng(attempt, has_credentials, &mut rand::thread_rng())
}

/// [`delay`] with a caller-supplied RNG.
pub fn delay_with_rng(attempt: u32, has_credentials: bool, rng: &mut impl Rng) -> Duration {
    if !has_credentials {
        return NO_CREDENTIAL_WAIT;
    }
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let capped = BASE.saturating_mul(factor).min(MAX);
    capped.mul_f64(rng.gen_range(1.0 - JITTER..=1.0 + JITTER))
}
