//! Operators running as child processes.
//!
//! One process per community. Everything the process needs is passed in its
//! environment:
//!
//! - `OPERATOR_CONFIG`: the per-community operator config as JSON
//! - `COMMUNITY_ADDRESS`: checksummed community address
//! - `JOIN_PART_STREAM_ID`: the community's join/part stream
//! - `STORE_DIR`: the community's store directory
//! - `STREAMR_WS_URL`: Streamr websocket API

use async_trait::async_trait;
use cps_core::operator::{
    JoinPartChannel, OperatorConfig, OperatorError, OperatorFactory, OperatorHandle, OperatorStore,
};
use cps_sdk::Address;
use cps_sdk::objects::OperatorStats;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use url::Url;

/// How long a freshly spawned operator must stay alive to count as started.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

pub struct ProcessOperatorFactory {
    command: String,
    args: Vec<String>,
    streamr_ws_url: Url,
    startup_grace: Duration,
}

impl ProcessOperatorFactory {
    pub fn new(command: String, args: Vec<String>, streamr_ws_url: Url) -> Self {
        Self {
            command,
            args,
            streamr_ws_url,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, startup_grace: Duration) -> Self {
        self.startup_grace = startup_grace;
        self
    }
}

impl OperatorFactory for ProcessOperatorFactory {
    fn build(
        &self,
        community: Address,
        channel: Box<dyn JoinPartChannel>,
        store: Box<dyn OperatorStore>,
    ) -> Box<dyn OperatorHandle> {
        Box::new(ProcessOperator {
            community,
            channel,
            store,
            command: self.command.clone(),
            args: self.args.clone(),
            streamr_ws_url: self.streamr_ws_url.clone(),
            startup_grace: self.startup_grace,
            child: Mutex::new(None),
        })
    }
}

pub struct ProcessOperator {
    community: Address,
    channel: Box<dyn JoinPartChannel>,
    store: Box<dyn OperatorStore>,
    command: String,
    args: Vec<String>,
    streamr_ws_url: Url,
    startup_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessOperator {
    fn spawn(&self, config: &OperatorConfig) -> Result<Child, OperatorError> {
        Command::new(&self.command)
            .args(&self.args)
            .env("OPERATOR_CONFIG", config.to_json())
            .env("COMMUNITY_ADDRESS", self.community.to_checksum())
            .env("JOIN_PART_STREAM_ID", self.channel.stream_id())
            .env("STORE_DIR", self.store.location())
            .env("STREAMR_WS_URL", self.streamr_ws_url.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OperatorError::Process(format!("failed to spawn {}: {e}", self.command)))
    }
}

#[async_trait]
impl OperatorHandle for ProcessOperator {
    async fn start(&mut self, config: &OperatorConfig) -> Result<(), OperatorError> {
        let mut child = self.spawn(config)?;
        tracing::info!(
            community = %self.community,
            pid = ?child.id(),
            command = %self.command,
            "Spawned operator process"
        );

        // A process that dies right away never started.
        match tokio::time::timeout(self.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(OperatorError::Process(format!(
                    "operator exited during startup with {status}"
                )));
            }
            Ok(Err(e)) => return Err(OperatorError::Process(e.to_string())),
            Err(_elapsed) => {}
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), OperatorError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Some(status) = child
            .try_wait()
            .map_err(|e| OperatorError::Process(e.to_string()))?
        {
            tracing::warn!(
                community = %self.community,
                status = %status,
                "Operator process had already exited"
            );
            return Ok(());
        }

        child
            .kill()
            .await
            .map_err(|e| OperatorError::Process(format!("failed to kill operator: {e}")))?;
        tracing::info!(community = %self.community, "Operator process stopped");
        Ok(())
    }

    async fn stats(&self) -> OperatorStats {
        self.store.stats().await
    }
}
