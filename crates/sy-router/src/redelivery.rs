//! Redelivery - bounded retry with a dead letter destination
//!
//! A failing delivery moves through `Attempting(n) -> Attempting(n + 1)` while
//! `n < maximum_redeliveries`, then to `DeadLetter`. The counter is the number of
//! redeliveries performed so far, so `maximum_redeliveries = 0` means exactly one attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{headers, DeliveryResult, Failure, Message};
use sy_config::RedeliverySettings;
use tracing::{debug, error, warn};

use crate::destination::{into_outcome, Destination, FailureDestination};

/// Retry limits and delay schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub redelivery_delay: Duration,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
    pub maximum_redelivery_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay: Duration::from_secs(60),
        }
    }
}

impl From<&RedeliverySettings> for RedeliveryPolicy {
    fn from(settings: &RedeliverySettings) -> Self {
        Self {
            maximum_redeliveries: settings.maximum_redeliveries,
            redelivery_delay: Duration::from_millis(settings.redelivery_delay_ms),
            use_exponential_backoff: settings.use_exponential_backoff,
            backoff_multiplier: settings.backoff_multiplier,
            maximum_redelivery_delay: Duration::from_millis(settings.maximum_redelivery_delay_ms),
        }
    }
}

/// Position of a message in the retry state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryState {
    /// Delivery in progress; the value is the number of redeliveries so far
    Attempting(u32),
    Done,
    DeadLetter,
}

impl RedeliveryPolicy {
    pub fn new(maximum_redeliveries: u32) -> Self {
        Self {
            maximum_redeliveries,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_exponential_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.use_exponential_backoff = true;
        self.backoff_multiplier = multiplier;
        self.maximum_redelivery_delay = max_delay;
        self
    }

    pub fn should_redeliver(&self, redeliveries: u32) -> bool {
        redeliveries < self.maximum_redeliveries
    }

    /// Transition taken after a failed attempt
    pub fn on_failure(&self, state: RedeliveryState) -> RedeliveryState {
        match state {
            RedeliveryState::Attempting(n) if self.should_redeliver(n) => RedeliveryState::Attempting(n + 1),
            RedeliveryState::Attempting(_) => RedeliveryState::DeadLetter,
            terminal => terminal,
        }
    }

    /// Transition taken after a successful attempt
    pub fn on_success(&self, state: RedeliveryState) -> RedeliveryState {
        match state {
            RedeliveryState::Attempting(_) => RedeliveryState::Done,
            terminal => terminal,
        }
    }

    /// Delay before the given redelivery (1-based)
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        if !self.use_exponential_backoff || redelivery <= 1 {
            return self.redelivery_delay;
        }

        let factor = self.backoff_multiplier.powi(redelivery as i32 - 1);
        let delay_ms = self.redelivery_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.maximum_redelivery_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Wraps a destination with redelivery and routes exhausted messages to a failure destination
pub struct DeadLetterChannel {
    name: String,
    destination: Arc<dyn Destination>,
    dead_letter: Arc<dyn FailureDestination>,
    policy: RedeliveryPolicy,
    handled: bool,
}

impl DeadLetterChannel {
    pub fn new(
        destination: Arc<dyn Destination>,
        dead_letter: Arc<dyn FailureDestination>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            name: format!("deadLetterChannel[{}]", destination.name()),
            destination,
            dead_letter,
            policy,
            handled: true,
        }
    }

    pub fn from_settings(
        destination: Arc<dyn Destination>,
        dead_letter: Arc<dyn FailureDestination>,
        settings: &RedeliverySettings,
    ) -> Self {
        Self::new(destination, dead_letter, RedeliveryPolicy::from(settings)).handled(settings.handled)
    }

    /// `true` suppresses the original failure after dead letter dispatch, `false` re-raises it
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Deliver with redelivery. Each retry starts from the message as it was before the
    /// failed attempt, tagged with the redelivery headers.
    pub async fn process(&self, message: Message) -> DeliveryResult {
        let mut current = message;
        let mut state = RedeliveryState::Attempting(0);
        let mut redeliveries = 0;
        let mut last_failure: Option<Failure> = None;

        loop {
            match state {
                RedeliveryState::Attempting(attempt) => {
                    redeliveries = attempt;
                    let result = self.destination.invoke(current.clone()).await;
                    let failure = match into_outcome(result, self.destination.name()) {
                        Ok(delivered) => {
                            current = delivered;
                            state = self.policy.on_success(state);
                            continue;
                        }
                        Err(failure) => failure,
                    };

                    state = self.policy.on_failure(state);
                    if let RedeliveryState::Attempting(next) = state {
                        current.redelivery_counter = next;
                        current.set_header(headers::REDELIVERED, true);
                        current.set_header(headers::REDELIVERY_COUNTER, next);

                        let delay = self.policy.delay_for(next);
                        debug!(
                            message_id = %current.id,
                            destination = %self.destination.name(),
                            attempt = next,
                            max_redeliveries = self.policy.maximum_redeliveries,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Delivery failed, scheduling redelivery"
                        );
                        metrics::counter!("switchyard_redeliveries_total").increment(1);

                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    last_failure = Some(failure);
                }
                RedeliveryState::Done => {
                    if redeliveries > 0 {
                        debug!(
                            message_id = %current.id,
                            destination = %self.destination.name(),
                            redeliveries = redeliveries,
                            "Delivery succeeded after redelivery"
                        );
                    }
                    return Ok(current);
                }
                RedeliveryState::DeadLetter => {
                    current.redelivery_counter = redeliveries;
                    current.set_header(headers::REDELIVERED, redeliveries > 0);
                    current.set_header(headers::REDELIVERY_COUNTER, redeliveries);
                    let failure = last_failure.take().unwrap_or_else(|| {
                        Failure::processing(format!("Delivery to {} failed", self.destination.name()))
                    });
                    return self.dead_letter(current, failure).await;
                }
            }
        }
    }

    async fn dead_letter(&self, mut message: Message, failure: Failure) -> DeliveryResult {
        warn!(
            message_id = %message.id,
            destination = %self.destination.name(),
            dead_letter = %self.dead_letter.name(),
            redeliveries = message.redelivery_counter,
            error = %failure,
            "Redelivery exhausted, moving message to dead letter destination"
        );
        metrics::counter!("switchyard_dead_letters_total").increment(1);

        message.set_failure(failure.clone());
        if let Err(dlq_failure) = self.dead_letter.deliver(message.clone()).await {
            error!(
                message_id = %message.id,
                dead_letter = %self.dead_letter.name(),
                error = %dlq_failure,
                "Dead letter delivery failed"
            );
            return Err(failure);
        }

        if !self.handled {
            return Err(failure);
        }

        message.take_failure();
        message.set_header(headers::FAILURE_HANDLED, true);
        message.set_header(headers::EXCEPTION_CAUGHT, failure.to_string());
        Ok(message)
    }
}

#[async_trait]
impl Destination for DeadLetterChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, message: Message) -> DeliveryResult {
        self.process(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Destination for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn invoke(&self, _message: Message) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::processing("Forced exception by unit test"))
        }
    }

    /// Fails until `succeed_on` calls have been made, recording the redelivery headers it saw
    struct FlakyDestination {
        calls: AtomicU32,
        succeed_on: u32,
        seen: Mutex<Vec<(Option<bool>, Option<u64>)>>,
    }

    #[async_trait]
    impl Destination for FlakyDestination {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(&self, mut message: Message) -> DeliveryResult {
            self.seen.lock().push((
                message.header_bool(headers::REDELIVERED),
                message.header_u64(headers::REDELIVERY_COUNTER),
            ));
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                message.set_failure(Failure::fault("not yet"));
                return Ok(message);
            }
            message.set_body("done");
            Ok(message)
        }
    }

    #[derive(Default)]
    struct MockDeadLetter {
        received: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl FailureDestination for MockDeadLetter {
        fn name(&self) -> &str {
            "mock:error"
        }

        async fn deliver(&self, message: Message) -> Result<(), Failure> {
            self.received.lock().push(message);
            Ok(())
        }
    }

    struct BrokenDeadLetter;

    #[async_trait]
    impl FailureDestination for BrokenDeadLetter {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _message: Message) -> Result<(), Failure> {
            Err(Failure::processing("dead letter unavailable"))
        }
    }

    async fn run_always_failing(max: u32) -> (u32, Message, DeliveryResult) {
        let destination = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let dead_letter = Arc::new(MockDeadLetter::default());
        let channel = DeadLetterChannel::new(
            destination.clone(),
            dead_letter.clone(),
            RedeliveryPolicy::new(max).with_delay(Duration::ZERO),
        )
        .handled(false);

        let result = channel.process(Message::new("Hello World")).await;
        let received = dead_letter.received.lock();
        assert_eq!(received.len(), 1);
        (destination.calls.load(Ordering::SeqCst), received[0].clone(), result)
    }

    #[tokio::test]
    async fn test_two_redeliveries() {
        let (calls, dead, result) = run_always_failing(2).await;
        assert_eq!(calls, 3);
        assert_eq!(dead.header_bool(headers::REDELIVERED), Some(true));
        assert_eq!(dead.header_u64(headers::REDELIVERY_COUNTER), Some(2));
        assert_eq!(dead.redelivery_counter, 2);
        assert!(dead.is_failed());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_redeliveries() {
        let (calls, dead, result) = run_always_failing(0).await;
        assert_eq!(calls, 1);
        assert_eq!(dead.header_bool(headers::REDELIVERED), Some(false));
        assert_eq!(dead.header_u64(headers::REDELIVERY_COUNTER), Some(0));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_one_redelivery() {
        let (calls, dead, _) = run_always_failing(1).await;
        assert_eq!(calls, 2);
        assert_eq!(dead.header_bool(headers::REDELIVERED), Some(true));
        assert_eq!(dead.header_u64(headers::REDELIVERY_COUNTER), Some(1));
    }

    #[tokio::test]
    async fn test_invocations_match_limit() {
        for max in 0..5u32 {
            let (calls, dead, _) = run_always_failing(max).await;
            assert_eq!(calls, max + 1);
            assert_eq!(dead.header_u64(headers::REDELIVERY_COUNTER), Some(max as u64));
            assert_eq!(dead.header_bool(headers::REDELIVERED), Some(max > 0));
        }
    }

    #[tokio::test]
    async fn test_unhandled_reraises_original_failure() {
        let (_, _, result) = run_always_failing(1).await;
        let failure = result.unwrap_err();
        assert_eq!(failure.message, "Forced exception by unit test");
        assert_eq!(failure.destination.as_deref(), Some("always-fails"));
    }

    #[tokio::test]
    async fn test_handled_suppresses_failure() {
        let dead_letter = Arc::new(MockDeadLetter::default());
        let channel = DeadLetterChannel::new(
            Arc::new(AlwaysFails { calls: AtomicU32::new(0) }),
            dead_letter.clone(),
            RedeliveryPolicy::new(1).with_delay(Duration::ZERO),
        );

        let message = channel.process(Message::new("Hello")).await.unwrap();
        assert!(!message.is_failed());
        assert_eq!(message.header_bool(headers::FAILURE_HANDLED), Some(true));
        assert!(message
            .header(headers::EXCEPTION_CAUGHT)
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("Forced exception"));
        assert_eq!(dead_letter.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_recovers_before_exhaustion() {
        let destination = Arc::new(FlakyDestination {
            calls: AtomicU32::new(0),
            succeed_on: 3,
            seen: Mutex::new(Vec::new()),
        });
        let dead_letter = Arc::new(MockDeadLetter::default());
        let channel = DeadLetterChannel::new(
            destination.clone(),
            dead_letter.clone(),
            RedeliveryPolicy::new(5).with_delay(Duration::ZERO),
        );

        let message = channel.process(Message::new("Hello")).await.unwrap();
        assert_eq!(message.body_str(), Some("done"));
        assert!(dead_letter.received.lock().is_empty());
        assert_eq!(
            *destination.seen.lock(),
            vec![(None, None), (Some(true), Some(1)), (Some(true), Some(2))]
        );
    }

    #[tokio::test]
    async fn test_dead_letter_failure_returns_original() {
        let channel = DeadLetterChannel::new(
            Arc::new(AlwaysFails { calls: AtomicU32::new(0) }),
            Arc::new(BrokenDeadLetter),
            RedeliveryPolicy::new(0),
        );

        let failure = channel.process(Message::new("Hello")).await.unwrap_err();
        assert_eq!(failure.message, "Forced exception by unit test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_attempts() {
        let channel = DeadLetterChannel::new(
            Arc::new(AlwaysFails { calls: AtomicU32::new(0) }),
            Arc::new(MockDeadLetter::default()),
            RedeliveryPolicy::new(3).with_delay(Duration::from_millis(100)),
        );

        let start = tokio::time::Instant::now();
        let _ = channel.process(Message::new("Hello")).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[test]
    fn test_state_machine() {
        let policy = RedeliveryPolicy::new(2);
        let s0 = RedeliveryState::Attempting(0);
        let s1 = policy.on_failure(s0);
        let s2 = policy.on_failure(s1);
        assert_eq!(s1, RedeliveryState::Attempting(1));
        assert_eq!(s2, RedeliveryState::Attempting(2));
        assert_eq!(policy.on_failure(s2), RedeliveryState::DeadLetter);
        assert_eq!(policy.on_failure(RedeliveryState::Done), RedeliveryState::Done);
        assert_eq!(policy.on_success(s1), RedeliveryState::Done);
        assert_eq!(policy.on_success(RedeliveryState::DeadLetter), RedeliveryState::DeadLetter);

        let none = RedeliveryPolicy::new(0);
        assert_eq!(none.on_failure(s0), RedeliveryState::DeadLetter);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RedeliveryPolicy::new(10)
            .with_delay(Duration::from_millis(100))
            .with_exponential_backoff(2.0, Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500));

        let flat = RedeliveryPolicy::new(3).with_delay(Duration::from_millis(100));
        assert_eq!(flat.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = RedeliverySettings {
            maximum_redeliveries: 4,
            redelivery_delay_ms: 250,
            ..Default::default()
        };
        let policy = RedeliveryPolicy::from(&settings);
        assert_eq!(policy.maximum_redeliveries, 4);
        assert_eq!(policy.redelivery_delay, Duration::from_millis(250));
        assert!(!policy.use_exponential_backoff);
    }
}
