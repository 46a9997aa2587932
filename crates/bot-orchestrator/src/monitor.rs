use perpbot_exchange::error::is_rate_limit_error;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// The maintenance loops every bot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorKind {
    PendingOrders,
    OrphanOrders,
    TakeProfit,
    TrailingCleaner,
    TrailingSync,
}

impl MonitorKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PendingOrders => "pending-orders",
            Self::OrphanOrders => "orphan-orders",
            Self::TakeProfit => "take-profit",
            Self::TrailingCleaner => "trailing-cleaner",
            Self::TrailingSync => "trailing-sync",
        }
    }

    #[must_use]
    pub const fn profile(self) -> IntervalProfile {
        match self {
            Self::PendingOrders => IntervalProfile {
                min: Duration::from_secs(15),
                start: Duration::from_secs(90),
                max: Duration::from_secs(120),
                warmup: None,
            },
            Self::OrphanOrders => IntervalProfile {
                min: Duration::from_secs(60),
                start: Duration::from_secs(120),
                max: Duration::from_secs(300),
                warmup: None,
            },
            Self::TakeProfit => IntervalProfile {
                min: Duration::from_secs(30),
                start: Duration::from_secs(120),
                max: Duration::from_secs(300),
                warmup: None,
            },
            Self::TrailingCleaner => IntervalProfile {
                min: Duration::from_secs(300),
                start: Duration::from_secs(300),
                max: Duration::from_secs(900),
                warmup: None,
            },
            Self::TrailingSync => IntervalProfile {
                min: Duration::from_secs(300),
                start: Duration::from_secs(300),
                max: Duration::from_secs(300),
                warmup: Some(Duration::from_secs(60)),
            },
        }
    }
}

/// Interval bounds for one monitor kind.
#[derive(Debug, Clone, Copy)]
pub struct IntervalProfile {
    pub min: Duration,
    pub start: Duration,
    pub max: Duration,
    /// Delay before the very first run, on top of the normal schedule.
    pub warmup: Option<Duration>,
}

/// Adaptive interval state for one `(bot, kind)` pair. Lives with the
/// monitor task and dies with the bot.
#[derive(Debug)]
pub struct MonitorRateState {
    kind: MonitorKind,
    profile: IntervalProfile,
    interval: Duration,
    error_count: u32,
    last_error_time: Option<Instant>,
    last_full_scan: Option<Instant>,
}

impl MonitorRateState {
    #[must_use]
    pub fn new(kind: MonitorKind) -> Self {
        let profile = kind.profile();
        Self {
            kind,
            profile,
            interval: profile.start,
            error_count: 0,
            last_error_time: None,
            last_full_scan: None,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub const fn error_count(&self) -> u32 {
        self.error_count
    }

    #[must_use]
    pub const fn last_error_time(&self) -> Option<Instant> {
        self.last_error_time
    }

    /// Success walks the interval back toward the minimum, one second per
    /// cycle, and clears the error streak.
    pub fn on_success(&mut self) {
        self.interval = self
            .interval
            .saturating_sub(Duration::from_secs(1))
            .max(self.profile.min);
        self.error_count = 0;
    }

    /// A rate-limit doubles the interval up to the maximum.
    pub fn on_rate_limited(&mut self) {
        self.interval = (self.interval * 2).min(self.profile.max);
        self.error_count += 1;
        self.last_error_time = Some(Instant::now());
    }

    /// Non-rate-limit failures leave the cadence alone, except for the
    /// trailing cleaner which stretches with its error streak.
    pub fn on_failure(&mut self) {
        self.error_count += 1;
        self.last_error_time = Some(Instant::now());
        if self.kind == MonitorKind::TrailingCleaner {
            let stretched =
                Duration::from_secs(300) + Duration::from_secs(120) * self.error_count;
            self.interval = stretched.min(Duration::from_secs(900));
        }
    }

    /// The orphan monitor widens to a full-account scan every 5 minutes;
    /// between those it only scans locally known symbols.
    pub fn take_full_scan_due(&mut self) -> bool {
        let due = self
            .last_full_scan
            .is_none_or(|at| at.elapsed() >= Duration::from_secs(300));
        if due {
            self.last_full_scan = Some(Instant::now());
        }
        due
    }
}

/// Outcome of one monitor callback, as classified by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    RateLimited,
    Failure,
}

fn classify(result: &anyhow::Result<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::Success,
        Err(e) if is_rate_limit_error(e) => Outcome::RateLimited,
        Err(_) => Outcome::Failure,
    }
}

/// Runs one monitor loop until the stop signal flips.
///
/// Callbacks of the same `(bot, kind)` are strictly serialized: the next
/// tick is only armed after the previous callback returns. The stop signal
/// is checked before arming each tick; an in-flight callback is not
/// interrupted, but its reschedule is dropped.
pub async fn run_monitor<F, Fut>(
    kind: MonitorKind,
    bot_id: i64,
    mut stop: watch::Receiver<bool>,
    mut callback: F,
) where
    F: FnMut(&mut MonitorRateState) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut state = MonitorRateState::new(kind);

    if let Some(warmup) = kind.profile().warmup {
        tokio::select! {
            () = tokio::time::sleep(warmup) => {}
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
        if run_once(kind, bot_id, &mut state, &mut callback).await.is_stop() {
            return;
        }
    }

    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(state.interval()) => {}
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
        if *stop.borrow() {
            return;
        }
        if run_once(kind, bot_id, &mut state, &mut callback).await.is_stop() {
            return;
        }
    }
}

enum Continuation {
    Continue,
    Stop,
}

impl Continuation {
    const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

async fn run_once<F, Fut>(
    kind: MonitorKind,
    bot_id: i64,
    state: &mut MonitorRateState,
    callback: &mut F,
) -> Continuation
where
    F: FnMut(&mut MonitorRateState) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let result = callback(state).await;
    match classify(&result) {
        Outcome::Success => state.on_success(),
        Outcome::RateLimited => {
            state.on_rate_limited();
            tracing::debug!(
                "Bot {} {} rate limited (streak {}), interval now {:?}",
                bot_id,
                kind.name(),
                state.error_count(),
                state.interval()
            );
        }
        Outcome::Failure => {
            if let Err(e) = &result {
                tracing::warn!("Bot {} {} failed: {e:#}", bot_id, kind.name());
            }
            state.on_failure();
        }
    }
    Continuation::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpbot_exchange::ExchangeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_until_max() {
        let mut state = MonitorRateState::new(MonitorKind::TakeProfit);
        assert_eq!(state.interval(), Duration::from_secs(120));

        for _ in 0..5 {
            state.on_rate_limited();
        }
        // min(300, 120 * 2^5) = 300.
        assert_eq!(state.interval(), Duration::from_secs(300));
        assert_eq!(state.error_count(), 5);
        assert!(state.last_error_time().is_some());
    }

    #[test]
    fn success_decrements_one_second_down_to_min() {
        let mut state = MonitorRateState::new(MonitorKind::TakeProfit);
        for _ in 0..3 {
            state.on_rate_limited();
        }
        assert_eq!(state.interval(), Duration::from_secs(300));

        state.on_success();
        assert_eq!(state.interval(), Duration::from_secs(299));
        assert_eq!(state.error_count(), 0);

        for _ in 0..1000 {
            state.on_success();
        }
        assert_eq!(state.interval(), MonitorKind::TakeProfit.profile().min);
    }

    #[test]
    fn plain_failure_keeps_interval_except_trailing_cleaner() {
        let mut state = MonitorRateState::new(MonitorKind::OrphanOrders);
        state.on_failure();
        assert_eq!(state.interval(), Duration::from_secs(120));

        let mut cleaner = MonitorRateState::new(MonitorKind::TrailingCleaner);
        cleaner.on_failure();
        // 5min + 1 * 2min.
        assert_eq!(cleaner.interval(), Duration::from_secs(420));
        for _ in 0..10 {
            cleaner.on_failure();
        }
        assert_eq!(cleaner.interval(), Duration::from_secs(900));
    }

    #[test]
    fn full_scan_due_every_five_minutes() {
        let mut state = MonitorRateState::new(MonitorKind::OrphanOrders);
        assert!(state.take_full_scan_due());
        assert!(!state.take_full_scan_due());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_runs_and_stops_cleanly() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_task = calls.clone();

        let handle = tokio::spawn(run_monitor(
            MonitorKind::PendingOrders,
            1,
            stop_rx,
            move |_state| {
                let calls = calls_in_task.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        // First tick fires after the start interval (90s).
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        let after_stop = calls.load(Ordering::SeqCst);

        // No callback fires after stop returns.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_callback_stretches_the_cadence() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_task = calls.clone();

        let handle = tokio::spawn(run_monitor(
            MonitorKind::TakeProfit,
            1,
            stop_rx,
            move |_state| {
                let calls = calls_in_task.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::Error::new(ExchangeError::RateLimited("429".into())))
                }
            },
        ));

        // start=120s: first call at 120s, second at 120+240, third at
        // 120+240+300 (capped).
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_sync_waits_for_warmup_then_runs() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_task = calls.clone();

        let handle = tokio::spawn(run_monitor(
            MonitorKind::TrailingSync,
            1,
            stop_rx,
            move |_state| {
                let calls = calls_in_task.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Warm-up of 60s, then the first run.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
