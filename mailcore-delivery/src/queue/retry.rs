//! Retry schedule (§4.7): fixed steps keyed off elapsed time since the
//! item was first queued, not off attempt count — a recipient that's
//! been failing for an hour waits 20 minutes no matter how many
//! individual attempts that represents.

use std::time::Duration;

use rand::Rng;

const ONE_MINUTE: Duration = Duration::from_secs(60);
const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);
const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);
const TWENTY_MINUTES: Duration = Duration::from_secs(20 * 60);
const MAX_JITTER_SECS: f64 = 60.0;

/// How long the send loop should sleep before its next retry pass,
/// given `elapsed` since the item was created. Adds up to 60s of
/// uniform jitter so a burst of items queued together doesn't retry in
/// lockstep.
#[must_use]
pub fn next_delay(elapsed: Duration) -> Duration {
    let base = if elapsed < ONE_MINUTE {
        ONE_MINUTE
    } else if elapsed < FIVE_MINUTES {
        FIVE_MINUTES
    } else if elapsed < TEN_MINUTES {
        TEN_MINUTES
    } else {
        TWENTY_MINUTES
    };

    let jitter = Duration::from_secs_f64(rand::rng().random_range(0.0..MAX_JITTER_SECS));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_steps_by_elapsed_time() {
        assert!(next_delay(Duration::from_secs(0)) >= ONE_MINUTE);
        assert!(next_delay(Duration::from_secs(0)) < ONE_MINUTE + Duration::from_secs(60));

        assert!(next_delay(Duration::from_secs(90)) >= FIVE_MINUTES);
        assert!(next_delay(Duration::from_secs(6 * 60)) >= TEN_MINUTES);
        assert!(next_delay(Duration::from_secs(11 * 60)) >= TWENTY_MINUTES);
        assert!(next_delay(Duration::from_secs(60 * 60)) >= TWENTY_MINUTES);
    }

    #[test]
    fn jitter_never_exceeds_sixty_seconds() {
        for _ in 0..100 {
            let delay = next_delay(Duration::from_secs(0));
            assert!(delay < ONE_MINUTE + Duration::from_secs(60));
        }
    }
}
