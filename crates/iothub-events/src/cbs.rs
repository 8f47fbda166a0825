//! Claims-based security: putting SAS tokens on `$cbs` and keeping them fresh.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::Error;
use crate::rpc::{self, STATUS_OK};
use crate::sas::{SharedAccessKey, SharedAccessSignature};
use crate::transport::{LinkSpec, Receiver, Sender, Session, close_detached};
use crate::types::Message;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const CBS_ADDRESS: &str = "$cbs";
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Local address the broker replies to.
const CBS_REPLY_TO: &str = "cbs";

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How long each token lives and how early it is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub token_lifetime: Duration,
    pub renewal_margin: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
        }
    }
}

impl RenewalPolicy {
    /// Time between successful puts.
    pub fn renewal_interval(&self) -> Duration {
        self.token_lifetime.saturating_sub(self.renewal_margin)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.token_lifetime.is_zero() {
            return Err(Error::Config("token lifetime must be positive".into()));
        }
        if self.renewal_margin >= self.token_lifetime {
            return Err(Error::Config(format!(
                "renewal margin ({}s) must be shorter than the token lifetime ({}s)",
                self.renewal_margin.as_secs(),
                self.token_lifetime.as_secs()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Renewer
// ---------------------------------------------------------------------------

/// Holds the `$cbs` link pair of one session.
pub struct TokenRenewer {
    key: SharedAccessKey,
    policy: RenewalPolicy,
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
}

impl TokenRenewer {
    pub async fn open(
        session: &dyn Session,
        key: SharedAccessKey,
        policy: RenewalPolicy,
    ) -> Result<Self, Error> {
        policy.validate()?;
        let sender = session
            .open_sender(LinkSpec::sender(CBS_ADDRESS).source(CBS_REPLY_TO))
            .await?;
        let receiver = match session
            .open_receiver(LinkSpec::receiver(CBS_ADDRESS).target(CBS_REPLY_TO))
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                close_detached("cbs sender", sender.close()).await;
                return Err(e.into());
            }
        };
        Ok(Self {
            key,
            policy,
            sender,
            receiver,
        })
    }

    /// Sign a fresh token for the hub and put it. Returns the token the
    /// broker accepted.
    pub async fn put_token(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<SharedAccessSignature, Error> {
        let audience = self.key.host_name.clone();
        let token = self.key.token(&audience, self.policy.token_lifetime)?;

        let mut request = Message::with_value(token.to_string())
            .application_property("operation", "put-token")
            .application_property("type", SAS_TOKEN_TYPE)
            .application_property("name", audience.as_str());
        request.properties.to = Some(CBS_ADDRESS.to_string());
        request.properties.reply_to = Some(CBS_REPLY_TO.to_string());

        let reply =
            rpc::exchange(self.sender.as_ref(), self.receiver.as_mut(), request, cancel).await?;
        let (code, description) = rpc::reply_status(&reply)?;
        if code != STATUS_OK {
            return Err(Error::TokenRejected { code, description });
        }

        tracing::info!(audience = %audience, expiry = %token.expiry, "token put");
        Ok(token)
    }

    /// Put one token now, then keep renewing it in the background every
    /// [`RenewalPolicy::renewal_interval`].
    ///
    /// The background task stops when `cancel` fires, when the handle is
    /// dropped, or after the first failed renewal. A stopped renewer lets
    /// the token expire, after which the broker detaches links
    /// authorized by it.
    pub async fn put_token_continuously(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<RenewalHandle, Error> {
        if let Err(e) = self.put_token(cancel).await {
            self.close().await;
            return Err(e);
        }

        let cancel = cancel.child_token();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.renew_loop(&task_cancel).await;
            self.close().await;
        });
        Ok(RenewalHandle {
            guard: cancel.clone().drop_guard(),
            cancel,
            task,
        })
    }

    async fn renew_loop(&mut self, cancel: &CancellationToken) {
        let interval = self.policy.renewal_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("token renewal stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match self.put_token(cancel).await {
                Ok(_) => {}
                Err(Error::Cancelled) => return,
                Err(e) => {
                    tracing::error!("token renewal failed, renewer terminated: {e}");
                    return;
                }
            }
        }
    }

    async fn close(self) {
        close_detached("cbs sender", self.sender.close()).await;
        close_detached("cbs receiver", self.receiver.close()).await;
    }
}

/// Open a renewer on `session` and start renewing.
pub async fn put_token_continuously(
    session: &dyn Session,
    key: SharedAccessKey,
    policy: RenewalPolicy,
    cancel: &CancellationToken,
) -> Result<RenewalHandle, Error> {
    TokenRenewer::open(session, key, policy)
        .await?
        .put_token_continuously(cancel)
        .await
}

/// Controls a background renewal task. Dropping the handle stops it.
pub struct RenewalHandle {
    cancel: CancellationToken,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RenewalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalHandle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl RenewalHandle {
    /// True once the task has exited, either stopped or after a failure.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop renewing and wait for the `$cbs` links to close.
    pub async fn stop(self) {
        self.cancel.cancel();
        drop(self.guard);
        if let Err(e) = self.task.await {
            tracing::warn!("token renewal task panicked: {e}");
        }
    }
}
