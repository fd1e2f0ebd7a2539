//! Destination traits consumed by the multicast dispatcher and the dead letter channel

use async_trait::async_trait;
use sy_common::{DeliveryResult, Failure, Message};

/// A routing destination. Receives its own copy of the message and returns the
/// (possibly mutated) message or a failure.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, message: Message) -> DeliveryResult;
}

/// Terminal destination for messages whose delivery attempts are exhausted
#[async_trait]
pub trait FailureDestination: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: Message) -> Result<(), Failure>;
}

/// Normalise a destination result: a returned message that carries a failure is a failure
pub(crate) fn into_outcome(result: DeliveryResult, destination: &str) -> DeliveryResult {
    match result {
        Ok(mut message) => match message.take_failure() {
            None => Ok(message),
            Some(failure) => Err(with_destination(failure, destination)),
        },
        Err(failure) => Err(with_destination(failure, destination)),
    }
}

fn with_destination(failure: Failure, destination: &str) -> Failure {
    if failure.destination.is_some() {
        failure
    } else {
        failure.at(destination)
    }
}
