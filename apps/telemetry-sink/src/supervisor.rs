use std::fmt::Display;
use tokio::time::{sleep, Duration};

/// Knows how to open one kind of connection and check that it is alive.
pub trait Connector {
    type Handle;
    type Error: Display;

    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Self::Handle, Self::Error>;

    /// Issued right after `connect`; a failed probe counts as a failed connect.
    async fn probe(&self, handle: &mut Self::Handle) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// A connection that is re-established forever until it succeeds.
pub struct Supervised<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    handle: Option<C::Handle>,
    state: ConnectionState,
    failed_attempts: u64,
}

impl<C: Connector> Supervised<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            handle: None,
            state: ConnectionState::Disconnected,
            failed_attempts: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed connect/probe attempts since the process started.
    #[cfg(test)]
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    /// Returns the live handle, blocking until one can be established.
    pub async fn acquire(&mut self) -> &mut C::Handle {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.establish().await,
        };
        self.handle.insert(handle)
    }

    pub fn invalidate(&mut self) {
        if self.handle.take().is_some() {
            tracing::warn!(
                connection = self.connector.name(),
                state = ?self.state,
                "dropping connection"
            );
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn establish(&mut self) -> C::Handle {
        loop {
            self.state = ConnectionState::Connecting;
            match self.try_connect().await {
                Ok(handle) => {
                    self.state = ConnectionState::Connected;
                    tracing::info!(connection = self.connector.name(), "connected");
                    return handle;
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    self.failed_attempts += 1;
                    tracing::error!(
                        connection = self.connector.name(),
                        error = %err,
                        attempts = self.failed_attempts,
                        retry_in_ms = self.policy.delay().as_millis() as u64,
                        "connection failed; retrying"
                    );
                    sleep(self.policy.delay()).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<C::Handle, C::Error> {
        let mut handle = self.connector.connect().await?;
        self.connector.probe(&mut handle).await?;
        Ok(handle)
    }
}
