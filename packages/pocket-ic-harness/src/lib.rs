//! # PocketIC harness: deterministic canister tests over HTTP
//!
//! This crate drives instances of the PocketIC server, a local simulation of
//! Internet Computer subnets, from blocking test code. It discovers or launches
//! the server, creates isolated instances with a chosen subnet topology, and
//! offers the calls a canister test needs: canister creation and installation,
//! update and query calls, time control, cycles and stable memory.
//!
//! ```rust,ignore
//! use candid::{IDLValue, Nat};
//! use pocket_ic_harness::PocketIc;
//!
//! #[test]
//! fn test_counter_canister() {
//!     let pic = PocketIc::new().unwrap();
//!     let counter = pic
//!         .create_and_install_canister_with_candid(COUNTER_DID, counter_wasm(), None, None)
//!         .unwrap();
//!     counter.invoke("set", &[IDLValue::Nat(Nat::from(7u64))]).unwrap();
//!     assert_eq!(
//!         counter.invoke("get", &[]).unwrap(),
//!         vec![IDLValue::Nat(Nat::from(7u64))]
//!     );
//! }
//! ```
//!
//! The server binary is looked up in `POCKET_IC_BIN`, falling back to
//! `./pocket-ic`. All instances created by one test process share one server.
//!
//! A [`PocketIc`] is meant for sequential use from one thread. It is not `Sync`,
//! so the current sender cannot race between concurrent calls.

use crate::common::rest::{
    BlobCompression, BlobId, ExtendedSubnetConfigSet, InstanceConfig, InstanceId, RawAddCycles,
    RawCanisterId, RawCycles, RawSetStableMemory, RawStableMemory, RawSubnetId, RawTime,
    RawTopology, SubnetKind, SubnetSpec, Topology,
};
use candid::{IDLValue, Principal};
use reqwest::Url;
use std::{
    cell::{Cell, RefCell},
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

mod call;
pub mod common;
pub mod error;
pub mod interface;
pub mod management_canister;
pub mod protocol;
pub mod server;

pub use crate::call::EffectivePrincipal;
pub use crate::error::{ErrorCode, PocketIcError, RejectCode, RejectResponse};
pub use crate::interface::{BoundMethod, CallMode, Canister, Interface, MethodDescriptor};
pub use crate::protocol::{Reply, WireProtocol};
pub use crate::server::{start_or_reuse_server, PocketIcServer};

/// Cycles given to canisters set up by [`PocketIc::create_and_install_canister_with_candid`].
pub const INITIAL_CYCLES: u128 = 2_000_000_000_000;

/// Main entry point for interacting with PocketIC.
///
/// The instance is deleted on the server by [`PocketIc::delete`] or, at the
/// latest, when the handle is dropped.
pub struct PocketIc {
    instance_id: InstanceId,
    server: PocketIcServer,
    sender: Cell<Principal>,
    topology: RefCell<Option<Topology>>,
    deleted: bool,
}

impl PocketIc {
    /// Creates a new instance with a single application subnet. The server is
    /// started if it's not already running.
    pub fn new() -> Result<Self, PocketIcError> {
        PocketIcBuilder::new().with_application_subnet().build()
    }

    /// Creates a new instance on an already connected server.
    pub fn from_config(
        server: PocketIcServer,
        config: &InstanceConfig,
    ) -> Result<Self, PocketIcError> {
        let (instance_id, topology) = server.create_instance(config)?;
        Ok(Self {
            instance_id,
            server,
            sender: Cell::new(Principal::anonymous()),
            topology: RefCell::new(topology),
            deleted: false,
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn server(&self) -> &PocketIcServer {
        &self.server
    }

    /// The subnets of this instance, fetched from the server on first use.
    pub fn topology(&self) -> Result<Topology, PocketIcError> {
        self.ensure_live()?;
        if let Some(topology) = self.topology.borrow().as_ref() {
            return Ok(topology.clone());
        }
        let raw: RawTopology = self.server.instance_get(self.instance_id, "read/topology")?;
        let topology = Topology::try_from(raw)?;
        *self.topology.borrow_mut() = Some(topology.clone());
        Ok(topology)
    }

    /// Deletes the instance on the server. Calling it again does nothing.
    pub fn delete(&mut self) -> Result<(), PocketIcError> {
        if self.deleted {
            return Ok(());
        }
        self.server.delete_instance(self.instance_id)?;
        self.deleted = true;
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn ensure_live(&self) -> Result<(), PocketIcError> {
        if self.deleted {
            return Err(PocketIcError::InstanceDeleted(self.instance_id));
        }
        Ok(())
    }

    /// Sets the sender of all following calls.
    pub fn set_sender(&self, sender: Principal) {
        self.sender.set(sender);
    }

    pub fn set_anonymous_sender(&self) {
        self.sender.set(Principal::anonymous());
    }

    pub fn sender(&self) -> Principal {
        self.sender.get()
    }

    /// Make the IC produce and progress by one block.
    pub fn tick(&self) -> Result<(), PocketIcError> {
        self.post("update/tick", &"")
    }

    /// Get the current time of the IC.
    pub fn get_time(&self) -> Result<SystemTime, PocketIcError> {
        let RawTime { nanos_since_epoch } = self.get("read/get_time")?;
        Ok(UNIX_EPOCH + Duration::from_nanos(nanos_since_epoch))
    }

    /// Set the current time of the IC.
    pub fn set_time(&self, time: SystemTime) -> Result<(), PocketIcError> {
        let nanos_since_epoch = time
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|since_epoch| u64::try_from(since_epoch.as_nanos()).ok())
            .ok_or_else(|| {
                PocketIcError::InvalidArguments(format!(
                    "{time:?} is not representable as nanoseconds since the Unix epoch"
                ))
            })?;
        self.post("update/set_time", &RawTime { nanos_since_epoch })
    }

    /// Advance the time on the IC by some duration.
    ///
    /// This reads the current time and sets the sum: a time change made by
    /// someone else in between is overwritten.
    pub fn advance_time(&self, duration: Duration) -> Result<(), PocketIcError> {
        let now = self.get_time()?;
        let later = now.checked_add(duration).ok_or_else(|| {
            PocketIcError::InvalidArguments(format!("advancing {now:?} by {duration:?} overflows"))
        })?;
        self.set_time(later)
    }

    /// Get the root key of the IC, or `None` if the instance has no NNS subnet.
    pub fn get_root_key(&self) -> Result<Option<Vec<u8>>, PocketIcError> {
        let Some(nns_subnet) = self.topology()?.get_nns() else {
            return Ok(None);
        };
        let body = RawSubnetId {
            subnet_id: nns_subnet.as_slice().to_vec(),
        };
        self.post("read/pub_key", &body).map(Some)
    }

    /// Get the subnet on which the given canister is hosted, if any.
    pub fn get_subnet(&self, canister_id: Principal) -> Result<Option<Principal>, PocketIcError> {
        let raw: Option<RawSubnetId> =
            self.post("read/get_subnet", &RawCanisterId::from(canister_id))?;
        raw.map(|RawSubnetId { subnet_id }| {
            Principal::try_from_slice(&subnet_id).map_err(|e| {
                PocketIcError::protocol_violation(
                    format!("invalid subnet id: {e}"),
                    hex::encode(&subnet_id),
                )
            })
        })
        .transpose()
    }

    /// Whether the canister id is hosted by a subnet of this instance. Installed
    /// code is not required.
    pub fn canister_exists(&self, canister_id: Principal) -> Result<bool, PocketIcError> {
        Ok(self.get_subnet(canister_id)?.is_some())
    }

    pub fn get_cycles_balance(&self, canister_id: Principal) -> Result<u128, PocketIcError> {
        let RawCycles { cycles } = self.post("read/get_cycles", &RawCanisterId::from(canister_id))?;
        Ok(cycles)
    }

    /// Add cycles to a canister. Returns the new balance.
    pub fn add_cycles(&self, canister_id: Principal, amount: u128) -> Result<u128, PocketIcError> {
        let body = RawAddCycles {
            canister_id: canister_id.as_slice().to_vec(),
            amount,
        };
        let RawCycles { cycles } = self.post("update/add_cycles", &body)?;
        Ok(cycles)
    }

    /// Upload and store a binary blob to the PocketIC server.
    pub fn upload_blob(
        &self,
        blob: Vec<u8>,
        compression: BlobCompression,
    ) -> Result<BlobId, PocketIcError> {
        self.ensure_live()?;
        self.server.upload_blob(blob, compression)
    }

    /// Set stable memory of a canister. With [`BlobCompression::Gzip`] the data
    /// must already be gzip-compressed; the server stores it decompressed.
    ///
    /// The upload and the write are separate requests.
    pub fn set_stable_memory(
        &self,
        canister_id: Principal,
        data: Vec<u8>,
        compression: BlobCompression,
    ) -> Result<(), PocketIcError> {
        let blob_id = self.upload_blob(data, compression)?;
        let body = RawSetStableMemory {
            canister_id: canister_id.as_slice().to_vec(),
            blob_id,
        };
        self.post("update/set_stable_memory", &body)
    }

    /// Get stable memory of a canister.
    pub fn get_stable_memory(&self, canister_id: Principal) -> Result<Vec<u8>, PocketIcError> {
        let RawStableMemory { blob } =
            self.post("read/get_stable_memory", &RawCanisterId::from(canister_id))?;
        Ok(blob)
    }

    /// Creates a canister, charges it with [`INITIAL_CYCLES`] and installs the
    /// wasm module with `init_arg` encoded against the constructor type of `did`.
    ///
    /// `did` is parsed before anything is sent, so a malformed document creates
    /// no canister.
    pub fn create_and_install_canister_with_candid(
        &self,
        did: &str,
        wasm_module: Vec<u8>,
        init_arg: Option<IDLValue>,
        subnet_id: Option<Principal>,
    ) -> Result<Canister<'_>, PocketIcError> {
        let interface = Interface::parse(did)?;
        let arg = interface.encode_init_arg(init_arg)?;
        let canister_id = match subnet_id {
            Some(subnet_id) => self.create_canister_on_subnet(None, subnet_id)?,
            None => self.create_canister()?,
        };
        self.add_cycles(canister_id, INITIAL_CYCLES)?;
        self.install_canister(canister_id, wasm_module, arg)?;
        Ok(Canister::new(self, canister_id, Arc::new(interface)))
    }

    /// Binds an already installed canister to its interface.
    pub fn canister(&self, canister_id: Principal, interface: Arc<Interface>) -> Canister<'_> {
        Canister::new(self, canister_id, interface)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T, PocketIcError> {
        self.ensure_live()?;
        self.server.instance_get(self.instance_id, endpoint)
    }

    fn post<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, PocketIcError> {
        self.ensure_live()?;
        self.server.instance_post(self.instance_id, endpoint, body)
    }
}

impl Drop for PocketIc {
    fn drop(&mut self) {
        if let Err(err) = self.delete() {
            warn!(instance_id = self.instance_id, %err, "failed to delete PocketIC instance");
        }
    }
}

impl std::fmt::Debug for PocketIc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PocketIc")
            .field("instance_id", &self.instance_id)
            .field("server_url", &self.server.url().as_str())
            .field("sender", &self.sender().to_text())
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// Configures and creates a [`PocketIc`] instance.
#[derive(Clone, Debug)]
pub struct PocketIcBuilder {
    config: InstanceConfig,
    server_url: Option<Url>,
    server_binary: Option<PathBuf>,
    max_request_time_ms: u64,
    protocol: WireProtocol,
}

#[allow(clippy::new_without_default)]
impl PocketIcBuilder {
    /// A builder without any subnets. At least one subnet or a state directory
    /// must be added before [`Self::build`].
    pub fn new() -> Self {
        Self {
            config: InstanceConfig::default(),
            server_url: None,
            server_binary: None,
            max_request_time_ms: server::DEFAULT_MAX_REQUEST_TIME_MS,
            protocol: WireProtocol::default(),
        }
    }

    pub fn build(self) -> Result<PocketIc, PocketIcError> {
        // Reject an empty topology before a server is started for it.
        self.config.validate()?;
        let url = match self.server_url {
            Some(url) => url,
            None => start_or_reuse_server(self.server_binary.as_deref())?,
        };
        let server = PocketIcServer::from_url(url, self.max_request_time_ms, self.protocol)?;
        PocketIc::from_config(server, &self.config)
    }

    /// The instance configuration sent to the server.
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Add a subnet of the given kind. NNS, SNS, II, Fiduciary and Bitcoin
    /// subnets are added at most once.
    pub fn with_subnet(mut self, kind: SubnetKind) -> Self {
        self.config
            .subnet_config_set
            .add(kind, SubnetSpec::default());
        self
    }

    /// Add a subnet of the given kind whose state is loaded from `path`.
    pub fn with_subnet_state(mut self, kind: SubnetKind, path: PathBuf) -> Self {
        self.config
            .subnet_config_set
            .add(kind, SubnetSpec::default().with_state_dir(path));
        self
    }

    /// Add an NNS subnet with state loaded from `path` and the given subnet id.
    pub fn with_nns_state(mut self, path: PathBuf, subnet_id: Principal) -> Self {
        self.config.subnet_config_set.add(
            SubnetKind::NNS,
            SubnetSpec::default().with_state_dir_and_id(path, subnet_id),
        );
        self
    }

    /// Add an empty application subnet.
    pub fn with_application_subnet(self) -> Self {
        self.with_subnet(SubnetKind::Application)
    }

    pub fn with_system_subnet(self) -> Self {
        self.with_subnet(SubnetKind::System)
    }

    pub fn with_verified_application_subnet(self) -> Self {
        self.with_subnet(SubnetKind::VerifiedApplication)
    }

    /// Add an empty NNS subnet; instances with one have a root key.
    pub fn with_nns_subnet(self) -> Self {
        self.with_subnet(SubnetKind::NNS)
    }

    pub fn with_sns_subnet(self) -> Self {
        self.with_subnet(SubnetKind::SNS)
    }

    pub fn with_ii_subnet(self) -> Self {
        self.with_subnet(SubnetKind::II)
    }

    pub fn with_fiduciary_subnet(self) -> Self {
        self.with_subnet(SubnetKind::Fiduciary)
    }

    pub fn with_bitcoin_subnet(self) -> Self {
        self.with_subnet(SubnetKind::Bitcoin)
    }

    /// Replace all requested subnets.
    pub fn with_subnet_config_set(mut self, subnet_config_set: ExtendedSubnetConfigSet) -> Self {
        self.config.subnet_config_set = subnet_config_set;
        self
    }

    /// Resume the instance from a state directory written by an earlier instance.
    pub fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.config.state_dir = Some(state_dir);
        self
    }

    pub fn with_nonmainnet_features(mut self, nonmainnet_features: bool) -> Self {
        self.config.nonmainnet_features = nonmainnet_features;
        self
    }

    /// Log level of the instance on the server, e.g. `"info"`.
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.config.log_level = Some(log_level.into());
        self
    }

    pub fn with_bitcoind_addr(mut self, bitcoind_addr: Vec<String>) -> Self {
        self.config.bitcoind_addr = Some(bitcoind_addr);
        self
    }

    /// Use the server at `url` instead of discovering or launching one.
    pub fn with_server_url(mut self, server_url: Url) -> Self {
        self.server_url = Some(server_url);
        self
    }

    /// Launch this binary if no server is running yet, instead of `POCKET_IC_BIN`.
    pub fn with_server_binary(mut self, server_binary: PathBuf) -> Self {
        self.server_binary = Some(server_binary);
        self
    }

    pub fn with_max_request_time_ms(mut self, max_request_time_ms: u64) -> Self {
        self.max_request_time_ms = max_request_time_ms;
        self
    }

    pub fn with_protocol(mut self, protocol: WireProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn empty_builder_fails_before_any_server_is_needed() {
        let result = PocketIcBuilder::new()
            .with_server_binary(PathBuf::from("/nonexistent/pocket-ic"))
            .build();
        assert_matches!(result, Err(PocketIcError::InvalidConfig(_)));
    }

    #[test]
    fn singleton_subnets_are_requested_once() {
        let builder = PocketIcBuilder::new()
            .with_nns_subnet()
            .with_nns_subnet()
            .with_ii_subnet()
            .with_application_subnet()
            .with_application_subnet();
        let set = &builder.config().subnet_config_set;
        assert_eq!(set.count(), 4);
        assert!(set.nns.is_some());
        assert_eq!(set.application.len(), 2);
    }

    #[test]
    fn nns_state_pins_the_subnet_id() {
        let subnet_id = Principal::from_slice(&[1; 29]);
        let builder = PocketIcBuilder::new().with_nns_state(PathBuf::from("/tmp/nns"), subnet_id);
        let json = serde_json::to_value(builder.config()).unwrap();
        assert_eq!(
            json["subnet_config_set"]["nns"]["state_config"]["FromPath"][1]["subnet_id"],
            serde_json::json!(base64::encode(subnet_id.as_slice()))
        );
    }
}
