//! # pace-limit
//!
//! `pace-limit` hands out permits at a steady pace, up to a cap per window.
//!
//! ## Core Philosophy
//!
//! Many services publish two limits at once: a per-call rate ("one request
//! every 250ms") and a per-window quota ("at most 1000 calls per hour").
//! A [`PacedLimiter`] enforces both so callers can simply ask for the next
//! permit and go as fast as they are allowed.
//!
//! ## Key Concepts
//!
//! * **Ticks**: A permit becomes available every `tick_interval`.
//! * **Windows**: At most `limit` permits are issued per window. Once they
//!   are spent, ticks are absorbed until `reset_interval` has elapsed.
//! * **Hand-off**: A permit is only issued to a consumer that is ready for
//!   it. Nothing is buffered, so a slow consumer slows the limiter down rather
//!   than building up a backlog.
//! * **Prompt shutdown**: [`PacedLimiter::stop`] is observed in every state,
//!   including while waiting for a window to reset.
//!
//! ## Example
//!
//! ```rust
//! use pace_limit::PacedLimiter;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), pace_limit::LimiterError> {
//! // One permit every 100ms, at most 5 per second.
//! let limiter = PacedLimiter::new(Duration::from_millis(100), 5, Duration::from_secs(1))?;
//!
//! limiter.wait().await?;
//! assert_eq!(limiter.remaining(), 4);
//!
//! limiter.stop();
//! assert!(limiter.wait().await.is_err());
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod limiter;
mod permits;
mod state;


pub use error::LimiterError;
pub use error::Result;
pub use limiter::PacedLimiter;
pub use limiter::PacedLimiterBuilder;
pub use permits::Permits;
pub use state::Lifecycle;
