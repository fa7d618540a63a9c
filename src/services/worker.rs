use std::sync::Arc;

use anyhow::{Error, Result};
use tokio::{
    task::JoinHandle,
    time::{Duration, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::broker::{Broker, GroupMember},
    services::consumer::NotificationConsumer,
};

/// Which topic a pool consumes, and therefore how each delivery is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRole {
    Primary,
    DeadLetter,
}

impl ConsumerRole {
    fn as_str(&self) -> &'static str {
        match self {
            ConsumerRole::Primary => "primary",
            ConsumerRole::DeadLetter => "dead-letter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub topic: String,
    pub group_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
}

/// A set of consumer group members, one tokio task each.
pub struct WorkerPool {
    role: ConsumerRole,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Joins the consumer group and starts polling. Workers run until
    /// `token` is cancelled, finishing the record in hand before they leave.
    pub async fn start(
        broker: Arc<dyn Broker>,
        consumer: Arc<NotificationConsumer>,
        role: ConsumerRole,
        settings: WorkerSettings,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        let members = broker
            .subscribe(&settings.topic, &settings.group_id, settings.concurrency.max(1))
            .await?;

        info!(
            role = role.as_str(),
            topic = %settings.topic,
            group_id = %settings.group_id,
            workers = members.len(),
            "Starting consumer workers"
        );

        let handles = members
            .into_iter()
            .map(|member| {
                tokio::spawn(run_worker(
                    member,
                    Arc::clone(&consumer),
                    role,
                    settings.poll_interval,
                    token.clone(),
                ))
            })
            .collect();

        Ok(Self { role, handles })
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(role = self.role.as_str(), error = %e, "Consumer worker task failed");
            }
        }

        info!(role = self.role.as_str(), "Consumer workers stopped");
    }
}

async fn run_worker(
    mut member: Box<dyn GroupMember>,
    consumer: Arc<NotificationConsumer>,
    role: ConsumerRole,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let member_id = member.member_id().to_string();
    debug!(member_id = %member_id, role = role.as_str(), "Consumer worker started");

    loop {
        let polled = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            polled = member.poll(poll_interval) => polled,
        };

        match polled {
            Ok(Some(delivery)) => {
                let outcome = match role {
                    ConsumerRole::Primary => consumer.handle_delivery(delivery).await,
                    ConsumerRole::DeadLetter => consumer.handle_dead_letter(delivery).await,
                };
                debug!(member_id = %member_id, ?outcome, "Record handled");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(member_id = %member_id, error = %e, "Poll failed, backing off");

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
        }
    }

    if let Err(e) = member.leave().await {
        warn!(member_id = %member_id, error = %e, "Failed to leave consumer group");
    }

    debug!(member_id = %member_id, role = role.as_str(), "Consumer worker stopped");
}
