//! Common doubles for integration tests: a scripted chain client, in-memory contract
//! adapters, a factory over them and a repository that counts writes.

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use evmreader::error::RepositoryError;
use evmreader::factory::{AdapterFactory, ApplicationAdapters, ApplicationContracts};
use evmreader::repository::RepoResult;
use evmreader::{
    Application, ApplicationAdapter, ApplicationState, BlockHeader, BlockTag, ChainClient,
    ClaimAcceptedObserved, ConsensusAdapter, Epoch, EpochInputs, EpochStatus, HeadSubscription,
    InMemoryRepository, InputAddedObserved, InputSourceAdapter, LogMeta, MonitoredEvent, Output,
    OutputExecutedObserved, ReaderError, Repository, Result,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("evmreader=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Log lines written while [LogCapture::install]'s guard is alive, without ANSI colours.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn count(&self, message: &str) -> usize {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes).matches(message).count()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

/// Enabled application `byte` with consensus `0xC0` and input source `0xB0`.
pub fn application(byte: u8, epoch_length: u64, deployment_block: u64) -> Application {
    Application {
        name: format!("app-{byte:02x}"),
        address: addr(byte),
        consensus_address: addr(0xc0),
        input_source_address: addr(0xb0),
        input_source_deployment_block: deployment_block,
        epoch_length,
        state: ApplicationState::Enabled,
        reason: None,
        last_input_check_block: 0,
        last_claim_check_block: 0,
        last_output_check_block: 0,
    }
}

pub fn header(number: u64) -> BlockHeader {
    BlockHeader {
        number,
        hash: Some(B256::left_padding_from(&(number + 1).to_be_bytes())),
        parent_hash: B256::left_padding_from(&number.to_be_bytes()),
    }
}

fn meta(block: u64) -> LogMeta {
    LogMeta {
        block_number: block,
        log_index: 0,
        transaction_hash: B256::repeat_byte(block as u8),
    }
}

pub fn input(app: Address, index: u64, block: u64) -> InputAddedObserved {
    InputAddedObserved {
        application: app,
        index,
        input: Bytes::from(format!("input-{index}").into_bytes()),
        meta: meta(block),
    }
}

pub fn claim(app: Address, last_processed: u64, hash: B256, block: u64) -> ClaimAcceptedObserved {
    ClaimAcceptedObserved {
        application: app,
        last_processed_block_number: last_processed,
        claim: hash,
        meta: meta(block),
    }
}

pub fn execution(index: u64, data: &'static [u8], block: u64) -> OutputExecutedObserved {
    OutputExecutedObserved {
        output_index: index,
        output: Bytes::from_static(data),
        meta: meta(block),
    }
}

pub fn output(app: Address, index: u64, data: &'static [u8]) -> Output {
    Output {
        application: app,
        input_index: 0,
        index,
        raw_data: Bytes::from_static(data),
        hash: None,
        execution_transaction_hash: None,
    }
}

/// Fetch calls seen by [MockChain]: `(from, to, applications)`.
pub type FetchCall = (u64, u64, Vec<Address>);

/// In-memory contract state shared by every adapter the [MockFactory] builds.
#[derive(Default)]
pub struct MockChain {
    pub inputs: Mutex<Vec<InputAddedObserved>>,
    pub claims: Mutex<Vec<ClaimAcceptedObserved>>,
    pub executions: Mutex<Vec<(Address, OutputExecutedObserved)>>,
    pub epoch_length: Mutex<u64>,
    pub input_calls: Mutex<Vec<FetchCall>>,
    pub claim_calls: Mutex<Vec<FetchCall>>,
    /// Deliver inputs newest-first, as overlapping chunks might.
    pub reverse_inputs: bool,
}

impl MockChain {
    pub fn add_inputs(&self, inputs: impl IntoIterator<Item = InputAddedObserved>) {
        self.inputs.lock().unwrap().extend(inputs);
    }

    pub fn add_claim(&self, claim: ClaimAcceptedObserved) {
        self.claims.lock().unwrap().push(claim);
    }

    pub fn add_execution(&self, app: Address, execution: OutputExecutedObserved) {
        self.executions.lock().unwrap().push((app, execution));
    }

    pub fn input_calls(&self) -> Vec<FetchCall> {
        self.input_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InputSourceAdapter for MockChain {
    async fn retrieve_inputs(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<InputAddedObserved>> {
        self.input_calls
            .lock()
            .unwrap()
            .push((from_block, to_block, applications.to_vec()));
        let mut found: Vec<InputAddedObserved> = self
            .inputs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| applications.contains(&e.application))
            .filter(|e| e.meta.block_number >= from_block && e.meta.block_number <= to_block)
            .cloned()
            .collect();
        if self.reverse_inputs {
            found.reverse();
        }
        Ok(found)
    }
}

#[async_trait]
impl ConsensusAdapter for MockChain {
    async fn retrieve_claim_accepted(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<ClaimAcceptedObserved>> {
        self.claim_calls
            .lock()
            .unwrap()
            .push((from_block, to_block, applications.to_vec()));
        Ok(self
            .claims
            .lock()
            .unwrap()
            .iter()
            .filter(|e| applications.contains(&e.application))
            .filter(|e| e.meta.block_number >= from_block && e.meta.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn epoch_length(&self) -> Result<u64> {
        Ok(*self.epoch_length.lock().unwrap())
    }
}

/// Application-contract view of [MockChain] for one application.
pub struct MockApplication {
    chain: Arc<MockChain>,
    address: Address,
}

#[async_trait]
impl ApplicationAdapter for MockApplication {
    async fn retrieve_output_executions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<OutputExecutedObserved>> {
        Ok(self
            .chain
            .executions
            .lock()
            .unwrap()
            .iter()
            .filter(|(app, e)| {
                *app == self.address
                    && e.meta.block_number >= from_block
                    && e.meta.block_number <= to_block
            })
            .map(|(_, e)| e.clone())
            .collect())
    }
}

pub struct MockFactory {
    pub chain: Arc<MockChain>,
    pub broken: Vec<Address>,
    pub created: AtomicUsize,
}

impl MockFactory {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            broken: Vec::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn adapters(&self, address: Address) -> ApplicationAdapters {
        ApplicationAdapters {
            application: Arc::new(MockApplication {
                chain: Arc::clone(&self.chain),
                address,
            }),
            input_source: self.chain.clone(),
            consensus: self.chain.clone(),
        }
    }

    pub fn contracts(&self, apps: &[Application]) -> Vec<ApplicationContracts> {
        apps.iter()
            .map(|app| ApplicationContracts {
                application: app.clone(),
                adapters: self.adapters(app.address),
            })
            .collect()
    }
}

impl AdapterFactory for MockFactory {
    fn create(&self, app: &Application, _cancel: &CancellationToken) -> Result<ApplicationAdapters> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(&app.address) {
            return Err(ReaderError::Adapter(format!("no adapters for {}", app.address)));
        }
        Ok(self.adapters(app.address))
    }
}

/// One scripted subscription: headers to deliver, then optionally a transport failure.
/// Without a failure the subscription stays open after its headers.
pub struct Script {
    pub headers: Vec<BlockHeader>,
    pub failure: Option<ReaderError>,
}

#[derive(Default)]
pub struct MockChainClient {
    pub chain_id: u64,
    pub policy_headers: Mutex<Vec<(BlockTag, BlockHeader)>>,
    pub scripts: Mutex<VecDeque<Result<Script>>>,
    pub subscriptions: AtomicUsize,
    pub header_lookups: Mutex<Vec<BlockTag>>,
    // Senders of open subscriptions; dropping them would end the stream.
    open: Mutex<Vec<(mpsc::Sender<BlockHeader>, oneshot::Sender<ReaderError>)>>,
}

impl MockChainClient {
    pub fn with_scripts(scripts: impl IntoIterator<Item = Result<Script>>) -> Self {
        Self {
            chain_id: 31337,
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Default::default()
        }
    }

    /// A client whose subscriptions stay open without delivering headers.
    pub fn idle() -> Self {
        Self::with_scripts(Vec::<Result<Script>>::new())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn header_by_number(&self, tag: BlockTag) -> Result<BlockHeader> {
        self.header_lookups.lock().unwrap().push(tag);
        self.policy_headers
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, h)| *h)
            .ok_or_else(|| ReaderError::Rpc(format!("no header for {tag:?}")))
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Ok(Script {
            headers: Vec::new(),
            failure: None,
        }))?;

        let (header_tx, header_rx) = mpsc::channel(script.headers.len() + 1);
        let (err_tx, err_rx) = oneshot::channel();
        for h in script.headers {
            header_tx.try_send(h).unwrap();
        }
        match script.failure {
            Some(failure) => {
                drop(header_tx);
                let _ = err_tx.send(failure);
            }
            None => self.open.lock().unwrap().push((header_tx, err_tx)),
        }
        Ok(HeadSubscription::new(header_rx, err_rx, None))
    }
}

/// [InMemoryRepository] that counts calls to each write method.
#[derive(Default)]
pub struct CountingRepository {
    inner: InMemoryRepository,
    pub list_calls: AtomicUsize,
    pub input_writes: AtomicUsize,
    pub claim_writes: AtomicUsize,
    pub output_writes: AtomicUsize,
    pub cursor_writes: AtomicUsize,
    pub state_writes: AtomicUsize,
}

impl CountingRepository {
    pub async fn with_apps(apps: impl IntoIterator<Item = Application>) -> Self {
        let repo = Self::default();
        for app in apps {
            repo.inner.insert_application(app).await;
        }
        repo
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Deref for CountingRepository {
    type Target = InMemoryRepository;

    fn deref(&self) -> &InMemoryRepository {
        &self.inner
    }
}

#[async_trait]
impl Repository for CountingRepository {
    async fn list_enabled_applications(&self) -> RepoResult<Vec<Application>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_enabled_applications().await
    }

    async fn create_epochs_and_inputs(
        &self,
        application: Address,
        epochs: Vec<EpochInputs>,
        last_input_check_block: u64,
    ) -> RepoResult<()> {
        self.input_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .create_epochs_and_inputs(application, epochs, last_input_check_block)
            .await
    }

    async fn get_epoch(&self, application: Address, index: u64) -> RepoResult<Option<Epoch>> {
        self.inner.get_epoch(application, index).await
    }

    async fn list_epochs_by_status(
        &self,
        application: Address,
        status: EpochStatus,
        before_block: u64,
    ) -> RepoResult<Vec<Epoch>> {
        self.inner
            .list_epochs_by_status(application, status, before_block)
            .await
    }

    async fn update_epochs_claim_accepted(
        &self,
        application: Address,
        epochs: &[Epoch],
        last_claim_check_block: u64,
    ) -> RepoResult<()> {
        self.claim_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_epochs_claim_accepted(application, epochs, last_claim_check_block)
            .await
    }

    async fn get_output(&self, application: Address, index: u64) -> RepoResult<Option<Output>> {
        self.inner.get_output(application, index).await
    }

    async fn update_outputs_execution(
        &self,
        application: Address,
        outputs: &[Output],
        last_output_check_block: u64,
    ) -> RepoResult<()> {
        self.output_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_outputs_execution(application, outputs, last_output_check_block)
            .await
    }

    async fn update_event_last_check_block(
        &self,
        applications: &[Address],
        event: MonitoredEvent,
        block: u64,
    ) -> RepoResult<()> {
        self.cursor_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_event_last_check_block(applications, event, block)
            .await
    }

    async fn update_application_state(
        &self,
        application: Address,
        state: ApplicationState,
        reason: Option<String>,
    ) -> RepoResult<()> {
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_application_state(application, state, reason)
            .await
    }
}

/// Move epoch `index` of `app` through the downstream stages up to ClaimSubmitted.
pub async fn submit_claim(
    repo: &InMemoryRepository,
    app: Address,
    index: u64,
    claim: B256,
) -> std::result::Result<(), RepositoryError> {
    repo.set_epoch_status(app, index, EpochStatus::ClaimComputed, Some(claim))
        .await?;
    repo.set_epoch_status(app, index, EpochStatus::ClaimSubmitted, None)
        .await
}

/// Poll `condition` until it holds, failing the test after ten (virtual) seconds.
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
