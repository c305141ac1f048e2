//! In-memory backends for exercising the engine without a real
//! marketplace, SSH or object storage.
//!
//! [`SimCloud`] simulates both the marketplace and the workers it
//! hands out. Each worker has a tiny filesystem that the simulated
//! transport interprets the engine's remote commands against. The
//! simulated `tar` writes archives as JSON maps of path to hex
//! content, which keeps byte flips inside an archive meaningful.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::common::lock;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::Endpoint;
use crate::model::Offer;
use crate::model::ResourceClass;
use crate::model::StorageLocation;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::provider::SharedProvider;
use crate::provider::WorkerProvider;
use crate::storage::sha256_hex;
use crate::storage::ObjectStore;
use crate::transport::CommandOutput;
use crate::transport::RemoteCommand;
use crate::transport::RemoteTransport;
use crate::transport::SharedTransport;

pub use crate::clock::TestingClock;

#[derive(Debug, Clone)]
struct SimOffer {
    offer: Offer,
    ready_after: Duration,
}

#[derive(Debug)]
struct SimWorker {
    worker: Worker,
    ready_at: Instant,
    destroyed: bool,
    unreachable: bool,
    offer_id: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct SimState {
    offers: Vec<SimOffer>,
    next_id: u64,
    workers: HashMap<WorkerId, SimWorker>,
    rate_limited_calls: u32,
    capacity_exhausted: bool,
    failing_offers: HashMap<String, u32>,
    destroy_failures: HashMap<WorkerId, u32>,
    transfer_failures: u32,
    provision_delay: Duration,
    writes_during_archive: HashMap<WorkerId, Vec<(String, Vec<u8>)>>,
    provisioned: Vec<WorkerId>,
    destroyed: Vec<WorkerId>,
}

impl SimState {
    fn take_rate_limit(&mut self, operation: &str) -> Result<()> {
        if self.rate_limited_calls > 0 {
            self.rate_limited_calls -= 1;
            return Err(EngineError::RateLimited(format!("{operation}: 429")));
        }
        Ok(())
    }

    fn by_host(&mut self, host: &str) -> Result<&mut SimWorker> {
        let now = Instant::now();
        let sim = self
            .workers
            .values_mut()
            .find(|w| w.worker.endpoint.host == host)
            .ok_or_else(|| EngineError::TransientNetwork(format!("{host}: no route to host")))?;
        if sim.destroyed || sim.unreachable || now < sim.ready_at {
            return Err(EngineError::TransientNetwork(format!(
                "{host}: connection refused"
            )));
        }
        Ok(sim)
    }
}

/// A simulated marketplace plus the workers it rents out.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimCloud {
    state: Arc<Mutex<SimState>>,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> SharedProvider {
        Arc::new(SimProvider {
            state: self.state.clone(),
        })
    }

    pub fn transport(&self) -> SharedTransport {
        Arc::new(SimTransport {
            state: self.state.clone(),
        })
    }

    /// List an offer whose workers answer on the transport
    /// `ready_after` they were provisioned.
    pub fn add_offer(&self, id: &str, class: &str, price_per_hour: f64, ready_after: Duration) {
        lock(&self.state).offers.push(SimOffer {
            offer: Offer {
                id: id.to_string(),
                resource_class: ResourceClass::from(class),
                price_per_hour,
                spot: true,
                region: None,
            },
            ready_after,
        });
    }

    pub fn offer(&self, id: &str) -> Offer {
        lock(&self.state)
            .offers
            .iter()
            .find(|o| o.offer.id == id)
            .map(|o| o.offer.clone())
            .unwrap_or_else(|| panic!("no offer {id}"))
    }

    /// Add an already running, reachable worker.
    pub fn add_worker(&self, class: &str) -> Worker {
        let mut state = lock(&self.state);
        let worker = new_worker(&mut state, &ResourceClass::from(class), WorkerState::Ready);
        state.workers.insert(
            worker.id.clone(),
            SimWorker {
                worker: worker.clone(),
                ready_at: Instant::now(),
                destroyed: false,
                unreachable: false,
                offer_id: None,
                files: BTreeMap::new(),
            },
        );
        worker
    }

    /// Fail the next `calls` provider calls with a rate limit.
    pub fn rate_limit_next(&self, calls: u32) {
        lock(&self.state).rate_limited_calls = calls;
    }

    /// Make every provision take `delay` before the worker exists.
    pub fn slow_provisioning(&self, delay: Duration) {
        lock(&self.state).provision_delay = delay;
    }

    pub fn exhaust_capacity(&self, exhausted: bool) {
        lock(&self.state).capacity_exhausted = exhausted;
    }

    /// Fail the next `times` provisions of this offer.
    pub fn fail_offer(&self, offer_id: &str, times: u32) {
        lock(&self.state)
            .failing_offers
            .insert(offer_id.to_string(), times);
    }

    pub fn fail_destroy(&self, worker_id: &WorkerId, times: u32) {
        lock(&self.state)
            .destroy_failures
            .insert(worker_id.clone(), times);
    }

    /// Fail the next `times` uploads or downloads.
    pub fn fail_transfers(&self, times: u32) {
        lock(&self.state).transfer_failures = times;
    }

    pub fn set_unreachable(&self, worker_id: &WorkerId, unreachable: bool) {
        if let Some(sim) = lock(&self.state).workers.get_mut(worker_id) {
            sim.unreachable = unreachable;
        }
    }

    /// Write a file on the worker just as the next archive of it
    /// starts, like a training job saving mid-snapshot.
    pub fn write_during_archive(&self, worker_id: &WorkerId, path: &str, data: &[u8]) {
        lock(&self.state)
            .writes_during_archive
            .entry(worker_id.clone())
            .or_default()
            .push((path.to_string(), data.to_vec()));
    }

    pub fn write_file(&self, worker_id: &WorkerId, path: &str, data: &[u8]) {
        if let Some(sim) = lock(&self.state).workers.get_mut(worker_id) {
            sim.files.insert(path.to_string(), data.to_vec());
        }
    }

    pub fn read_file(&self, worker_id: &WorkerId, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .workers
            .get(worker_id)
            .and_then(|sim| sim.files.get(path).cloned())
    }

    pub fn files(&self, worker_id: &WorkerId) -> BTreeMap<String, Vec<u8>> {
        lock(&self.state)
            .workers
            .get(worker_id)
            .map(|sim| sim.files.clone())
            .unwrap_or_default()
    }

    /// Every successful provision, in order.
    pub fn provisioned(&self) -> Vec<WorkerId> {
        lock(&self.state).provisioned.clone()
    }

    /// The offer a provisioned worker was rented from.
    pub fn offer_of(&self, worker_id: &WorkerId) -> Option<String> {
        lock(&self.state)
            .workers
            .get(worker_id)
            .and_then(|sim| sim.offer_id.clone())
    }

    /// Every successful destroy, in order.
    pub fn destroyed(&self) -> Vec<WorkerId> {
        lock(&self.state).destroyed.clone()
    }

    pub fn is_destroyed(&self, worker_id: &WorkerId) -> bool {
        lock(&self.state)
            .workers
            .get(worker_id)
            .map_or(false, |sim| sim.destroyed)
    }

    /// Workers provisioned and not yet destroyed.
    pub fn live_workers(&self) -> Vec<WorkerId> {
        let mut live: Vec<_> = lock(&self.state)
            .workers
            .values()
            .filter(|sim| !sim.destroyed)
            .map(|sim| sim.worker.id.clone())
            .collect();
        live.sort();
        live
    }
}

fn new_worker(state: &mut SimState, class: &ResourceClass, worker_state: WorkerState) -> Worker {
    state.next_id += 1;
    let id = WorkerId(format!("sim-{}", state.next_id));
    Worker {
        handle: format!("instance-{}", state.next_id),
        endpoint: Endpoint {
            host: format!("{id}.sim.internal"),
            port: 22,
            user: "root".to_string(),
            credentials_ref: None,
        },
        id,
        resource_class: class.clone(),
        state: worker_state,
        last_heartbeat: None,
        created_at: Utc::now(),
    }
}

pub struct SimProvider {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl WorkerProvider for SimProvider {
    async fn list_offers(
        &self,
        resource_class: &ResourceClass,
        max_price: Option<f64>,
    ) -> Result<Vec<Offer>> {
        let mut state = lock(&self.state);
        state.take_rate_limit("list_offers")?;
        Ok(state
            .offers
            .iter()
            .filter(|o| &o.offer.resource_class == resource_class)
            .filter(|o| max_price.map_or(true, |max| o.offer.price_per_hour <= max))
            .map(|o| o.offer.clone())
            .collect())
    }

    async fn provision(&self, offer: &Offer) -> Result<Worker> {
        let delay = lock(&self.state).provision_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        state.take_rate_limit("provision")?;
        if state.capacity_exhausted {
            return Err(EngineError::CapacityUnavailable(format!(
                "offer {} taken",
                offer.id
            )));
        }
        if let Some(left) = state.failing_offers.get_mut(&offer.id) {
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::CapacityUnavailable(format!(
                    "offer {} no longer available",
                    offer.id
                )));
            }
        }
        let ready_after = state
            .offers
            .iter()
            .find(|o| o.offer.id == offer.id)
            .map(|o| o.ready_after)
            .ok_or_else(|| EngineError::NotFound(format!("offer {}", offer.id)))?;
        let worker = new_worker(&mut state, &offer.resource_class, WorkerState::Provisioning);
        state.workers.insert(
            worker.id.clone(),
            SimWorker {
                worker: worker.clone(),
                ready_at: Instant::now() + ready_after,
                destroyed: false,
                unreachable: false,
                offer_id: Some(offer.id.clone()),
                files: BTreeMap::new(),
            },
        );
        state.provisioned.push(worker.id.clone());
        Ok(worker)
    }

    async fn destroy(&self, worker_id: &WorkerId) -> Result<()> {
        let state = &mut *lock(&self.state);
        state.take_rate_limit("destroy")?;
        if let Some(left) = state.destroy_failures.get_mut(worker_id) {
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::TransientNetwork(format!(
                    "destroy {worker_id}: 503"
                )));
            }
        }
        if let Some(sim) = state.workers.get_mut(worker_id) {
            if !sim.destroyed {
                sim.destroyed = true;
                sim.worker.state = WorkerState::Destroyed;
                state.destroyed.push(worker_id.clone());
            }
        }
        Ok(())
    }

    async fn connection_info(&self, worker_id: &WorkerId) -> Result<Endpoint> {
        let mut state = lock(&self.state);
        state.take_rate_limit("connection_info")?;
        match state.workers.get(worker_id) {
            Some(sim) if !sim.destroyed => Ok(sim.worker.endpoint.clone()),
            _ => Err(EngineError::NotFound(format!("worker {worker_id}"))),
        }
    }
}

pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn exit(exit_code: i32, stderr: String) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr,
    }
}

fn under<'a>(
    files: &'a BTreeMap<String, Vec<u8>>,
    root: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
    let prefix = format!("{}/", root.trim_end_matches('/'));
    files
        .iter()
        .filter(move |(path, _)| path.as_str() == root || path.starts_with(&prefix))
}

fn interpret(files: &mut BTreeMap<String, Vec<u8>>, cmd: &RemoteCommand) -> CommandOutput {
    let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
    match (cmd.program.as_str(), args.as_slice()) {
        ("true", _) | ("mkdir", _) => ok(String::new()),
        ("rm", ["-rf", paths @ ..]) => {
            for path in paths {
                let doomed: Vec<String> = under(files, path).map(|(p, _)| p.clone()).collect();
                for p in doomed {
                    files.remove(&p);
                }
            }
            ok(String::new())
        }
        ("rm", [_flag, paths @ ..]) => {
            for path in paths {
                files.remove(*path);
            }
            ok(String::new())
        }
        ("find", rest) => {
            let roots: Vec<&str> = rest.iter().take_while(|a| !a.starts_with('-')).copied().collect();
            let mut stdout = String::new();
            for root in roots {
                let mut found = false;
                for (path, data) in under(files, root) {
                    found = true;
                    stdout.push_str(&format!("{}  {path}\n", sha256_hex(data)));
                }
                if !found {
                    return exit(1, format!("find: '{root}': No such file or directory"));
                }
            }
            ok(stdout)
        }
        ("sha256sum", rest) => {
            let mut stdout = String::new();
            let mut stderr = String::new();
            for path in rest.iter().filter(|a| **a != "--") {
                match files.get(*path) {
                    Some(data) => stdout.push_str(&format!("{}  {path}\n", sha256_hex(data))),
                    None => stderr.push_str(&format!("sha256sum: {path}: No such file or directory\n")),
                }
            }
            CommandOutput {
                exit_code: if stderr.is_empty() { 0 } else { 1 },
                stdout,
                stderr,
            }
        }
        ("tar", ["-czPf", archive, roots @ ..]) => {
            let mut packed = BTreeMap::new();
            for root in roots {
                let before = packed.len();
                for (path, data) in under(files, root) {
                    packed.insert(path.clone(), hex::encode(data));
                }
                if packed.len() == before {
                    return exit(2, format!("tar: {root}: Cannot stat: No such file or directory"));
                }
            }
            match serde_json::to_vec(&packed) {
                Ok(bytes) => {
                    files.insert(archive.to_string(), bytes);
                    ok(String::new())
                }
                Err(err) => exit(2, err.to_string()),
            }
        }
        ("tar", ["-xzPf", archive]) => unpack(files, archive, ""),
        ("tar", ["-xzf", archive, "-C", dir]) => unpack(files, archive, dir.trim_end_matches('/')),
        (program, _) => exit(127, format!("{program}: command not found")),
    }
}

/// Unpack a simulated archive with every member placed under `root`.
fn unpack(files: &mut BTreeMap<String, Vec<u8>>, archive: &str, root: &str) -> CommandOutput {
    let unpacked = files
        .get(archive)
        .and_then(|bytes| serde_json::from_slice::<BTreeMap<String, String>>(bytes).ok());
    let Some(unpacked) = unpacked else {
        return exit(2, "gzip: stdin: not in gzip format".to_string());
    };
    for (path, content) in unpacked {
        let Ok(data) = hex::decode(&content) else {
            return exit(2, "tar: Unexpected EOF in archive".to_string());
        };
        let path = if root.is_empty() {
            path
        } else {
            format!("{root}/{}", path.trim_start_matches('/'))
        };
        files.insert(path, data);
    }
    ok(String::new())
}

#[async_trait]
impl RemoteTransport for SimTransport {
    async fn exec(&self, endpoint: &Endpoint, command: &RemoteCommand) -> Result<CommandOutput> {
        let state = &mut *lock(&self.state);
        let worker_id = state.by_host(&endpoint.host)?.worker.id.clone();
        let archiving =
            command.program == "tar" && command.args.first().map(String::as_str) == Some("-czPf");
        let landing = if archiving {
            state.writes_during_archive.remove(&worker_id).unwrap_or_default()
        } else {
            Vec::new()
        };
        let sim = state.by_host(&endpoint.host)?;
        sim.files.extend(landing);
        Ok(interpret(&mut sim.files, command))
    }

    async fn upload(&self, endpoint: &Endpoint, data: &[u8], remote_path: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.transfer_failures > 0 {
            state.transfer_failures -= 1;
            return Err(EngineError::TransientNetwork("upload: connection reset".into()));
        }
        let sim = state.by_host(&endpoint.host)?;
        sim.files.insert(remote_path.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, endpoint: &Endpoint, remote_path: &str) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.transfer_failures > 0 {
            state.transfer_failures -= 1;
            return Err(EngineError::TransientNetwork("download: connection reset".into()));
        }
        let sim = state.by_host(&endpoint.host)?;
        sim.files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| EngineError::CommandFailed {
                command: format!("cat {remote_path}"),
                exit_code: 1,
                stderr: format!("cat: {remote_path}: No such file or directory"),
            })
    }
}

/// How [`MemObjectStore`] answers checksum requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// The checksum of what was put.
    Honest,
    /// No provider-side checksum; callers must download and hash.
    Missing,
    /// A checksum that matches nothing.
    Lie,
}

#[derive(Debug)]
struct MemObjects {
    objects: HashMap<StorageLocation, (Vec<u8>, String)>,
    mode: ChecksumMode,
    put_failures: u32,
}

/// Write-once object store held in memory.
///
/// Clones share contents.
#[derive(Debug, Clone)]
pub struct MemObjectStore {
    inner: Arc<Mutex<MemObjects>>,
}

impl Default for MemObjectStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemObjects {
                objects: HashMap::new(),
                mode: ChecksumMode::Honest,
                put_failures: 0,
            })),
        }
    }
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_checksum_mode(&self, mode: ChecksumMode) {
        lock(&self.inner).mode = mode;
    }

    pub fn fail_puts(&self, times: u32) {
        lock(&self.inner).put_failures = times;
    }

    /// Flip one hex digit near the end of a stored object, leaving
    /// its recorded checksum alone like silent bit rot would.
    pub fn corrupt(&self, location: &StorageLocation) -> bool {
        let mut inner = lock(&self.inner);
        let Some((data, _)) = inner.objects.get_mut(location) else {
            return false;
        };
        match data.iter().rposition(u8::is_ascii_hexdigit) {
            Some(i) => {
                data[i] = if data[i] == b'0' { b'1' } else { b'0' };
                true
            }
            None => match data.last_mut() {
                Some(byte) => {
                    *byte ^= 0x01;
                    true
                }
                None => false,
            },
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put(&self, location: &StorageLocation, data: Vec<u8>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.put_failures > 0 {
            inner.put_failures -= 1;
            return Err(EngineError::TransientNetwork(format!("put {location}: 503")));
        }
        if inner.objects.contains_key(location) {
            return Err(EngineError::Conflict(format!(
                "object {location} already exists"
            )));
        }
        let sum = sha256_hex(&data);
        inner.objects.insert(location.clone(), (data, sum));
        Ok(())
    }

    async fn get(&self, location: &StorageLocation) -> Result<Vec<u8>> {
        lock(&self.inner)
            .objects
            .get(location)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| EngineError::NotFound(format!("object {location}")))
    }

    async fn checksum(&self, location: &StorageLocation) -> Result<Option<String>> {
        let inner = lock(&self.inner);
        let (_, sum) = inner
            .objects
            .get(location)
            .ok_or_else(|| EngineError::NotFound(format!("object {location}")))?;
        Ok(match inner.mode {
            ChecksumMode::Honest => Some(sum.clone()),
            ChecksumMode::Missing => None,
            ChecksumMode::Lie => Some("0".repeat(64)),
        })
    }
}
