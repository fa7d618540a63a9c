use anyhow::Result;
use notification_dispatch::{
    models::event::NotificationChannel,
    services::{dispatcher::NotificationDispatcher, senders::SenderConfig},
};
use tokio_test::assert_err;

use crate::common::{PanickingSender, RecordingSender, event};

/// Test: A channel that never fails reports success
#[tokio::test]
async fn test_dispatch_success() -> Result<()> {
    let dispatcher = NotificationDispatcher::with_simulated_senders(&SenderConfig::uniform(0.0));

    for channel in NotificationChannel::ALL {
        assert!(
            dispatcher.dispatch(&event(channel)).await?,
            "{} should deliver",
            channel
        );
    }

    Ok(())
}

/// Test: A channel that always fails reports an ordinary failure, not an error
#[tokio::test]
async fn test_dispatch_channel_failure() -> Result<()> {
    let dispatcher = NotificationDispatcher::with_simulated_senders(&SenderConfig::uniform(1.0));

    let delivered = dispatcher.dispatch(&event(NotificationChannel::Email)).await?;

    assert!(!delivered);

    Ok(())
}

/// Test: A panicking sender surfaces as an unexpected error
#[tokio::test]
async fn test_dispatch_panic_is_error() {
    let sender = PanickingSender::always(NotificationChannel::Webhook);
    let dispatcher = NotificationDispatcher::new().register(sender.clone());

    let result = dispatcher.dispatch(&event(NotificationChannel::Webhook)).await;

    assert_err!(result, "Panic should not be reported as a send result");
    assert_eq!(sender.calls(), 1);
}

/// Test: Events for a channel without a sender are an unexpected error
#[tokio::test]
async fn test_dispatch_unregistered_channel() {
    let dispatcher = NotificationDispatcher::new()
        .register(RecordingSender::new(NotificationChannel::Email, true));

    let result = dispatcher.dispatch(&event(NotificationChannel::Push)).await;

    assert_err!(result);
}

/// Test: Registering a sender replaces the previous one for that channel
#[tokio::test]
async fn test_register_replaces_sender() -> Result<()> {
    let replacement = RecordingSender::new(NotificationChannel::Sms, true);
    let dispatcher = NotificationDispatcher::with_simulated_senders(&SenderConfig::uniform(1.0))
        .register(replacement.clone());

    let sms = event(NotificationChannel::Sms);

    assert!(dispatcher.dispatch(&sms).await?);
    assert_eq!(replacement.seen(), vec![sms.event_id().to_string()]);

    Ok(())
}
