//! Engine client: supervises the engine process connection and exposes
//! one typed call per protocol operation.
//!
//! The connection lives in a four-state machine (stopped → starting →
//! running → stopping → stopped) owned entirely by this module. An
//! unexpected close while running is a fault: pending requests are
//! failed, the event is logged, and a fresh tracked start brings the
//! state back to running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use engine_proto::{
    CallTreeNode, CloseDocumentParams, DocumentParams, ExpandCallTreeNodeParams,
    ExpandCallTreeNodeResult, FunctionNode, InitializeParams, InitializeResult, ProcessFunction,
    ProcessInfo, ProcessSampleInfo, ReadDocumentParams, ReadDocumentResult,
    RetrieveCallTreeHotPathParams, RetrieveCallTreeHotPathResult, RetrieveCallersCalleesParams,
    RetrieveCallersCalleesResult, RetrieveFunctionsPageParams, RetrieveFunctionsPageResult,
    RetrieveHottestFunctionsParams, RetrieveHottestFunctionsResult, RetrieveLineInfoParams,
    RetrieveLineInfoResult, RetrieveProcessSampleInfoParams, RetrieveProcessSampleInfoResult,
    RetrieveProcessesResult, RetrieveSampleSourcesResult, RetrieveSessionInfoResult,
    RetrieveSystemInfoResult, SampleSourceInfo, SessionInfo, SetDwarfSymbolFindOptionsParams,
    SetModuleFiltersParams, SetModulePathMapsParams, SetPdbSymbolFindOptionsParams,
    SetSampleFiltersParams, SystemInfo, methods,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::settings::EngineSettings;
use crate::transport::{EngineConnector, EngineLink, LinkEvent, TransportError};

pub mod dispatcher;
pub mod progress;

use dispatcher::{Dispatcher, RpcFailure, decode};
use progress::{ProgressBridge, Settled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("engine client is not connected")]
    NotConnected,
    #[error("engine rejected initialization")]
    InitializeRejected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcFailure),
}

struct ActiveLink {
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    link: EngineLink,
    monitor: Option<JoinHandle<()>>,
    settings_task: JoinHandle<()>,
}

struct ClientInner {
    connector: Box<dyn EngineConnector>,
    settings: watch::Receiver<EngineSettings>,
    state_tx: watch::Sender<ConnectionState>,
    start_lock: Mutex<()>,
    link: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
}

/// Cheaply cloneable handle to one supervised engine connection.
#[derive(Clone)]
pub struct EngineClient {
    inner: Arc<ClientInner>,
}

impl EngineClient {
    pub fn new(
        connector: impl EngineConnector + 'static,
        settings: watch::Receiver<EngineSettings>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        Self {
            inner: Arc::new(ClientInner {
                connector: Box::new(connector),
                settings,
                state_tx,
                start_lock: Mutex::new(()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Brings the connection up. Single-flight: a caller arriving while a
    /// start is underway waits for that attempt; one arriving when the
    /// client already runs succeeds immediately.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _flight = self.inner.start_lock.lock().await;
        if self.state() == ConnectionState::Running {
            return Ok(());
        }
        self.start_locked().await
    }

    /// The start attempt itself; the caller holds the start lock.
    async fn start_locked(&self) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Starting);
        match self.establish().await {
            Ok((active, events)) => {
                let generation = active.generation;
                *self.inner.link.lock().await = Some(active);
                // The monitor starts only once the link is current, so a
                // close event always finds the right slot.
                let monitor = tokio::spawn(monitor_link(self.clone(), events, generation));
                if let Some(active) = self.inner.link.lock().await.as_mut() {
                    active.monitor = Some(monitor);
                }
                self.set_state(ConnectionState::Running);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Stopped);
                Err(err)
            }
        }
    }

    /// Shuts the engine down gracefully and tears the link down.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let _flight = self.inner.start_lock.lock().await;
        match self.state() {
            ConnectionState::Running | ConnectionState::Stopping => {}
            ConnectionState::Starting | ConnectionState::Stopped => {
                return Err(ClientError::NotConnected);
            }
        }
        self.set_state(ConnectionState::Stopping);
        let active = self.inner.link.lock().await.take();
        if let Some(active) = active {
            if let Some(monitor) = &active.monitor {
                monitor.abort();
            }
            active.settings_task.abort();
            // Best-effort: the engine may already be gone.
            if let Err(err) = active.dispatcher.request(methods::SHUTDOWN, None).await {
                warn!(
                    target: "heatline::client",
                    error = %err,
                    "engine shutdown request failed"
                );
            }
            let _ = active.dispatcher.notify(methods::EXIT, None);
            active.dispatcher.shutdown().await;
            active.link.dispose();
        }
        self.set_state(ConnectionState::Stopped);
        Ok(())
    }

    async fn establish(
        &self,
    ) -> Result<(ActiveLink, mpsc::UnboundedReceiver<LinkEvent>), ClientError> {
        let settings = self.inner.settings.borrow().clone();
        let mut link = self.inner.connector.connect(&settings).await?;
        let inbound = link
            .take_inbound()
            .ok_or_else(|| TransportError::Setup("link inbound already taken".into()))?;
        let events = link
            .take_events()
            .ok_or_else(|| TransportError::Setup("link events already taken".into()))?;
        let dispatcher = Arc::new(Dispatcher::spawn(link.sender(), inbound));

        if let Err(err) = initialize_link(&dispatcher, &settings).await {
            dispatcher.shutdown().await;
            link.dispose();
            return Err(err);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let settings_task = tokio::spawn(watch_settings(
            self.inner.settings.clone(),
            Arc::clone(&dispatcher),
        ));
        Ok((
            ActiveLink {
                generation,
                dispatcher,
                link,
                monitor: None,
                settings_task,
            },
            events,
        ))
    }

    /// Reacts to the link's close signal. Only the current link's monitor
    /// gets past the generation check; stale ones return quietly.
    fn handle_closed(&self, generation: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let must_restart = {
            let mut slot = self.inner.link.lock().await;
            let is_current = slot
                .as_ref()
                .map(|active| active.generation == generation)
                .unwrap_or(false);
            if !is_current {
                return;
            }
            if let Some(active) = slot.take() {
                active.settings_task.abort();
                active.dispatcher.shutdown().await;
                active.link.dispose();
            }
            // The running→starting restart edge; closure in any other
            // state is expected and only torn down.
            if self.state() == ConnectionState::Running {
                self.set_state(ConnectionState::Starting);
                true
            } else {
                false
            }
        };
        if !must_restart {
            return;
        }
        error!(
            target: "heatline::client",
            "engine connection closed unexpectedly, restarting"
        );
        let _flight = self.inner.start_lock.lock().await;
        if let Err(err) = self.start_locked().await {
            error!(
                target: "heatline::client",
                error = %err,
                "engine restart failed"
            );
        }
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            let previous = *current;
            debug!(
                target: "heatline::client",
                from = ?previous,
                to = ?state,
                "connection state change"
            );
            *current = state;
            true
        });
    }

    /// Waits out an in-flight start, then hands back the live dispatcher.
    /// Fails immediately with `NotConnected` when there is none.
    async fn live_dispatcher(&self) -> Result<Arc<Dispatcher>, ClientError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let state = *state_rx
            .wait_for(|state| *state != ConnectionState::Starting)
            .await
            .map_err(|_| ClientError::NotConnected)?;
        if state != ConnectionState::Running {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.dispatcher))
            .ok_or(ClientError::NotConnected)
    }

    async fn call<P, T>(&self, method: &'static str, params: P) -> Result<T, ClientError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let dispatcher = self.live_dispatcher().await?;
        let params = serde_json::to_value(params).map_err(RpcFailure::from)?;
        let result = dispatcher.request(method, Some(params)).await?;
        Ok(decode(result)?)
    }

    /// Generic progress-tracked call; the typed wrappers below cover the
    /// operations the engine reports progress for.
    pub async fn call_tracked<P, T>(
        &self,
        bridge: &ProgressBridge,
        method: &'static str,
        params: P,
    ) -> Result<Settled<T>, ClientError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let dispatcher = self.live_dispatcher().await?;
        let params = serde_json::to_value(params).map_err(RpcFailure::from)?;
        Ok(bridge.call(&dispatcher, method, params).await?)
    }

    async fn send_notification<P: Serialize>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<(), ClientError> {
        let dispatcher = self.live_dispatcher().await?;
        let params = serde_json::to_value(params).map_err(RpcFailure::from)?;
        dispatcher.notify(method, Some(params))?;
        Ok(())
    }

    // ---- typed operations ------------------------------------------------

    pub async fn read_document(&self, file_path: &str) -> Result<u32, ClientError> {
        let result: ReadDocumentResult = self
            .call(
                methods::READ_DOCUMENT,
                ReadDocumentParams {
                    file_path: file_path.to_string(),
                    work_done_token: None,
                },
            )
            .await?;
        Ok(result.document_id)
    }

    pub async fn read_document_tracked(
        &self,
        bridge: &ProgressBridge,
        file_path: &str,
    ) -> Result<Settled<u32>, ClientError> {
        let settled: Settled<ReadDocumentResult> = self
            .call_tracked(
                bridge,
                methods::READ_DOCUMENT,
                ReadDocumentParams {
                    file_path: file_path.to_string(),
                    work_done_token: None,
                },
            )
            .await?;
        Ok(settled.map(|result| result.document_id))
    }

    pub async fn close_document(&self, document_id: u32) -> Result<(), ClientError> {
        self.send_notification(methods::CLOSE_DOCUMENT, CloseDocumentParams { document_id })
            .await
    }

    pub async fn retrieve_sample_sources(
        &self,
        document_id: u32,
    ) -> Result<Vec<SampleSourceInfo>, ClientError> {
        let result: RetrieveSampleSourcesResult = self
            .call(
                methods::RETRIEVE_SAMPLE_SOURCES,
                DocumentParams { document_id },
            )
            .await?;
        Ok(result.sample_sources)
    }

    pub async fn retrieve_session_info(&self, document_id: u32) -> Result<SessionInfo, ClientError> {
        let result: RetrieveSessionInfoResult = self
            .call(
                methods::RETRIEVE_SESSION_INFO,
                DocumentParams { document_id },
            )
            .await?;
        Ok(result.session_info)
    }

    pub async fn retrieve_system_info(&self, document_id: u32) -> Result<SystemInfo, ClientError> {
        let result: RetrieveSystemInfoResult = self
            .call(methods::RETRIEVE_SYSTEM_INFO, DocumentParams { document_id })
            .await?;
        Ok(result.system_info)
    }

    pub async fn retrieve_processes(
        &self,
        document_id: u32,
    ) -> Result<Vec<ProcessInfo>, ClientError> {
        let result: RetrieveProcessesResult = self
            .call(methods::RETRIEVE_PROCESSES, DocumentParams { document_id })
            .await?;
        Ok(result.processes)
    }

    pub async fn set_sample_filters(
        &self,
        params: SetSampleFiltersParams,
    ) -> Result<(), ClientError> {
        self.call(methods::SET_SAMPLE_FILTERS, params).await
    }

    pub async fn retrieve_hottest_functions(
        &self,
        document_id: u32,
        source_id: u64,
        count: u32,
    ) -> Result<Vec<ProcessFunction>, ClientError> {
        let result: RetrieveHottestFunctionsResult = self
            .call(
                methods::RETRIEVE_HOTTEST_FUNCTIONS,
                RetrieveHottestFunctionsParams {
                    document_id,
                    source_id,
                    count,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(result.functions)
    }

    pub async fn retrieve_hottest_functions_tracked(
        &self,
        bridge: &ProgressBridge,
        document_id: u32,
        source_id: u64,
        count: u32,
    ) -> Result<Settled<Vec<ProcessFunction>>, ClientError> {
        let settled: Settled<RetrieveHottestFunctionsResult> = self
            .call_tracked(
                bridge,
                methods::RETRIEVE_HOTTEST_FUNCTIONS,
                RetrieveHottestFunctionsParams {
                    document_id,
                    source_id,
                    count,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(settled.map(|result| result.functions))
    }

    pub async fn retrieve_process_sample_info(
        &self,
        document_id: u32,
        process_key: u64,
    ) -> Result<ProcessSampleInfo, ClientError> {
        let result: RetrieveProcessSampleInfoResult = self
            .call(
                methods::RETRIEVE_PROCESS_SAMPLE_INFO,
                RetrieveProcessSampleInfoParams {
                    document_id,
                    process_key,
                },
            )
            .await?;
        Ok(result.info)
    }

    pub async fn retrieve_call_tree_hot_path(
        &self,
        document_id: u32,
        source_id: u64,
        process_key: u64,
    ) -> Result<CallTreeNode, ClientError> {
        let result: RetrieveCallTreeHotPathResult = self
            .call(
                methods::RETRIEVE_CALL_TREE_HOT_PATH,
                RetrieveCallTreeHotPathParams {
                    document_id,
                    source_id,
                    process_key,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(result.root)
    }

    pub async fn retrieve_call_tree_hot_path_tracked(
        &self,
        bridge: &ProgressBridge,
        document_id: u32,
        source_id: u64,
        process_key: u64,
    ) -> Result<Settled<CallTreeNode>, ClientError> {
        let settled: Settled<RetrieveCallTreeHotPathResult> = self
            .call_tracked(
                bridge,
                methods::RETRIEVE_CALL_TREE_HOT_PATH,
                RetrieveCallTreeHotPathParams {
                    document_id,
                    source_id,
                    process_key,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(settled.map(|result| result.root))
    }

    pub async fn retrieve_functions_page(
        &self,
        params: RetrieveFunctionsPageParams,
    ) -> Result<Vec<FunctionNode>, ClientError> {
        let result: RetrieveFunctionsPageResult =
            self.call(methods::RETRIEVE_FUNCTIONS_PAGE, params).await?;
        Ok(result.functions)
    }

    pub async fn retrieve_functions_page_tracked(
        &self,
        bridge: &ProgressBridge,
        params: RetrieveFunctionsPageParams,
    ) -> Result<Settled<Vec<FunctionNode>>, ClientError> {
        let settled: Settled<RetrieveFunctionsPageResult> = self
            .call_tracked(bridge, methods::RETRIEVE_FUNCTIONS_PAGE, params)
            .await?;
        Ok(settled.map(|result| result.functions))
    }

    pub async fn expand_call_tree_node(
        &self,
        document_id: u32,
        process_key: u64,
        node_id: u64,
    ) -> Result<Vec<CallTreeNode>, ClientError> {
        let result: ExpandCallTreeNodeResult = self
            .call(
                methods::EXPAND_CALL_TREE_NODE,
                ExpandCallTreeNodeParams {
                    document_id,
                    process_key,
                    node_id,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(result.children)
    }

    pub async fn expand_call_tree_node_tracked(
        &self,
        bridge: &ProgressBridge,
        document_id: u32,
        process_key: u64,
        node_id: u64,
    ) -> Result<Settled<Vec<CallTreeNode>>, ClientError> {
        let settled: Settled<ExpandCallTreeNodeResult> = self
            .call_tracked(
                bridge,
                methods::EXPAND_CALL_TREE_NODE,
                ExpandCallTreeNodeParams {
                    document_id,
                    process_key,
                    node_id,
                    work_done_token: None,
                },
            )
            .await?;
        Ok(settled.map(|result| result.children))
    }

    pub async fn retrieve_callers_callees(
        &self,
        params: RetrieveCallersCalleesParams,
    ) -> Result<RetrieveCallersCalleesResult, ClientError> {
        self.call(methods::RETRIEVE_CALLERS_CALLEES, params).await
    }

    pub async fn retrieve_callers_callees_tracked(
        &self,
        bridge: &ProgressBridge,
        params: RetrieveCallersCalleesParams,
    ) -> Result<Settled<RetrieveCallersCalleesResult>, ClientError> {
        self.call_tracked(bridge, methods::RETRIEVE_CALLERS_CALLEES, params)
            .await
    }

    /// `None` when the engine has no line-level data for the function;
    /// that is a valid outcome, not a failure.
    pub async fn retrieve_line_info(
        &self,
        document_id: u32,
        process_key: u64,
        function_id: u64,
    ) -> Result<Option<RetrieveLineInfoResult>, ClientError> {
        self.call(
            methods::RETRIEVE_LINE_INFO,
            RetrieveLineInfoParams {
                document_id,
                process_key,
                function_id,
                work_done_token: None,
            },
        )
        .await
    }

    pub async fn retrieve_line_info_tracked(
        &self,
        bridge: &ProgressBridge,
        document_id: u32,
        process_key: u64,
        function_id: u64,
    ) -> Result<Settled<Option<RetrieveLineInfoResult>>, ClientError> {
        self.call_tracked(
            bridge,
            methods::RETRIEVE_LINE_INFO,
            RetrieveLineInfoParams {
                document_id,
                process_key,
                function_id,
                work_done_token: None,
            },
        )
        .await
    }
}

async fn initialize_link(
    dispatcher: &Dispatcher,
    settings: &EngineSettings,
) -> Result<(), ClientError> {
    let result = dispatcher
        .request(
            methods::INITIALIZE,
            Some(serde_json::to_value(InitializeParams::default()).map_err(RpcFailure::from)?),
        )
        .await?;
    let initialize: InitializeResult = decode(result)?;
    if !initialize.success {
        return Err(ClientError::InitializeRejected);
    }
    apply_settings(dispatcher, settings)?;
    Ok(())
}

/// Sends the engine every configuration notification it honors. Called
/// after initialize and again whenever the settings hub publishes.
fn apply_settings(dispatcher: &Dispatcher, settings: &EngineSettings) -> Result<(), RpcFailure> {
    dispatcher.notify(
        methods::SET_MODULE_PATH_MAPS,
        Some(serde_json::to_value(SetModulePathMapsParams {
            simple_maps: settings.module_path_maps.clone(),
        })?),
    )?;
    dispatcher.notify(
        methods::SET_PDB_SYMBOL_FIND_OPTIONS,
        Some(serde_json::to_value(SetPdbSymbolFindOptionsParams {
            search_dirs: settings.symbol_search_dirs.clone(),
            no_default_urls: settings.no_default_urls,
            symbol_server_urls: settings.symbol_server_urls.clone(),
            symbol_cache_dir: settings.symbol_cache_dir.clone(),
        })?),
    )?;
    dispatcher.notify(
        methods::SET_DWARF_SYMBOL_FIND_OPTIONS,
        Some(serde_json::to_value(SetDwarfSymbolFindOptionsParams {
            search_dirs: settings.dwarf_search_dirs.clone(),
            no_default_urls: settings.no_default_urls,
            debuginfod_urls: settings.debuginfod_urls.clone(),
            debuginfod_cache_dir: settings.debuginfod_cache_dir.clone(),
        })?),
    )?;
    dispatcher.notify(
        methods::SET_MODULE_FILTERS,
        Some(serde_json::to_value(SetModuleFiltersParams {
            mode: settings.module_filter_mode,
            include: settings.module_include.clone(),
            exclude: settings.module_exclude.clone(),
        })?),
    )?;
    Ok(())
}

async fn watch_settings(mut rx: watch::Receiver<EngineSettings>, dispatcher: Arc<Dispatcher>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Err(err) = apply_settings(&dispatcher, &snapshot) {
            warn!(
                target: "heatline::client",
                error = %err,
                "stopping settings forwarding"
            );
            break;
        }
        debug!(target: "heatline::client", "engine settings re-applied");
    }
}

async fn monitor_link(
    client: EngineClient,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    generation: u64,
) {
    loop {
        match events.recv().await {
            Some(LinkEvent::Error(message)) => {
                // Errors are informational; the close that follows is what
                // moves the state machine.
                warn!(target: "heatline::client", %message, "engine transport error");
            }
            Some(LinkEvent::Closed) | None => break,
        }
    }
    client.handle_closed(generation).await;
}
