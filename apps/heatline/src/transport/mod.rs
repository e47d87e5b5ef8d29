//! Engine channel plumbing: a message-framed duplex link to the spawned
//! analysis engine, plus the connector abstraction the client is built
//! against so tests can swap the process for an in-memory peer.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::settings::EngineSettings;

pub mod mock;
pub mod pipe;

const CHILD_REAP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn engine '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipe setup failed: {0}")]
    Setup(String),
    #[error("engine did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("engine channel closed")]
    ChannelClosed,
}

/// Out-of-band link lifecycle signals, delivered on a per-link channel.
/// Errors are informational; a `Closed` is what ends the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Error(String),
    Closed,
}

/// One established duplex connection to an engine process. Frames are
/// whole JSON messages; ordering is preserved in each direction.
pub struct EngineLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineLink {
    pub(crate) fn from_parts(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        child: Option<Child>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            events: Some(events),
            child,
            tasks,
        }
    }

    /// Handle for queueing outbound frames; sends fail once the link dies.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// The inbound frame stream. Yields `None` after the peer closes.
    /// Can be taken once; the dispatcher owns it for the link's lifetime.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inbound.take()
    }

    /// The lifecycle event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    /// Tears the link down: stops the io tasks and reaps the engine
    /// process, giving it a grace period to exit on its own first.
    pub fn dispose(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            tokio::spawn(async move {
                if tokio::time::timeout(CHILD_REAP_TIMEOUT, child.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        target: "heatline::transport",
                        "engine did not exit in time, killing it"
                    );
                    let _ = child.start_kill();
                }
            });
        }
    }
}

/// Establishes engine links. The production connector spawns the engine
/// binary and binds a pipe; tests inject in-memory peers.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, settings: &EngineSettings) -> Result<EngineLink, TransportError>;
}
