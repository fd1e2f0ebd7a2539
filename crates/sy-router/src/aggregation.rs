//! Aggregation strategies for multicast results

use sy_common::Message;

/// Folds branch results into a single message.
///
/// Called only from the dispatcher's coordinating task, one result at a time.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, accumulated: Option<Message>, next: Message) -> Message;
}

/// Keeps whichever result was folded last
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestAggregationStrategy;

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, _accumulated: Option<Message>, next: Message) -> Message {
        next
    }
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Message>, Message) -> Message + Send + Sync,
{
    fn aggregate(&self, accumulated: Option<Message>, next: Message) -> Message {
        self(accumulated, next)
    }
}
