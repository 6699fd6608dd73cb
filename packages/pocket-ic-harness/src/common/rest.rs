//! Rust structs that reflect the structure of JSON-objects used in the REST-API
//! of the PocketIC server.
//!
//! Binary fields (principals, payloads, blob ids) travel as base64 text.

use crate::error::PocketIcError;
use candid::Principal;
use serde::{
    de::Error as _, ser::SerializeTupleVariant, Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};
use strum_macros::{Display, EnumIter};

pub type InstanceId = usize;

/// (De)serializes byte vectors as base64 text.
pub mod base64 {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&::base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        ::base64::decode(text).map_err(D::Error::custom)
    }
}

// ================================================================================================================= //
// Instance configuration

/// The kind of a subnet.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter, Display,
)]
pub enum SubnetKind {
    Application,
    Bitcoin,
    Fiduciary,
    II,
    NNS,
    SNS,
    System,
    VerifiedApplication,
}

impl SubnetKind {
    /// Kinds of which an instance hosts at most one subnet.
    pub fn is_singleton(self) -> bool {
        !matches!(
            self,
            SubnetKind::Application | SubnetKind::System | SubnetKind::VerifiedApplication
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubnetInstructionConfig {
    /// Instruction limits as on mainnet.
    #[default]
    Production,
    /// Instruction limits raised for benchmarking.
    Benchmarking,
}

/// Where a subnet's state comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SubnetStateConfig {
    /// A fresh, empty subnet.
    #[default]
    New,
    /// State loaded from a directory that must be readable by the server process.
    FromPath(PathBuf),
    /// Like `FromPath`, but the subnet keeps the given id.
    FromPathWithId(PathBuf, Principal),
}

impl Serialize for SubnetStateConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SubnetStateConfig::New => {
                serializer.serialize_unit_variant("SubnetStateConfig", 0, "New")
            }
            SubnetStateConfig::FromPath(path) => {
                serializer.serialize_newtype_variant("SubnetStateConfig", 1, "FromPath", path)
            }
            SubnetStateConfig::FromPathWithId(path, subnet_id) => {
                let mut variant =
                    serializer.serialize_tuple_variant("SubnetStateConfig", 1, "FromPath", 2)?;
                variant.serialize_field(path)?;
                variant.serialize_field(&RawSubnetId {
                    subnet_id: subnet_id.as_slice().to_vec(),
                })?;
                variant.end()
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubnetSpec {
    state_config: SubnetStateConfig,
    instruction_config: SubnetInstructionConfig,
}

impl SubnetSpec {
    pub fn with_state_dir(mut self, path: PathBuf) -> Self {
        self.state_config = SubnetStateConfig::FromPath(path);
        self
    }

    pub fn with_state_dir_and_id(mut self, path: PathBuf, subnet_id: Principal) -> Self {
        self.state_config = SubnetStateConfig::FromPathWithId(path, subnet_id);
        self
    }

    pub fn with_benchmarking_instruction_config(mut self) -> Self {
        self.instruction_config = SubnetInstructionConfig::Benchmarking;
        self
    }

    pub fn state_config(&self) -> &SubnetStateConfig {
        &self.state_config
    }

    pub fn instruction_config(&self) -> SubnetInstructionConfig {
        self.instruction_config
    }
}

/// The simple form of a subnet request: flags for singleton kinds, counts for the rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubnetConfigSet {
    pub nns: bool,
    pub sns: bool,
    pub ii: bool,
    pub fiduciary: bool,
    pub bitcoin: bool,
    pub system: usize,
    pub application: usize,
    pub verified_application: usize,
}

/// The subnets requested for a new instance.
///
/// Singleton kinds are held as an `Option`, so requesting one of them twice
/// collapses to a single subnet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExtendedSubnetConfigSet {
    pub nns: Option<SubnetSpec>,
    pub sns: Option<SubnetSpec>,
    pub ii: Option<SubnetSpec>,
    pub fiduciary: Option<SubnetSpec>,
    pub bitcoin: Option<SubnetSpec>,
    pub system: Vec<SubnetSpec>,
    pub application: Vec<SubnetSpec>,
    pub verified_application: Vec<SubnetSpec>,
}

impl From<SubnetConfigSet> for ExtendedSubnetConfigSet {
    fn from(set: SubnetConfigSet) -> Self {
        let flag = |requested: bool| requested.then(SubnetSpec::default);
        ExtendedSubnetConfigSet {
            nns: flag(set.nns),
            sns: flag(set.sns),
            ii: flag(set.ii),
            fiduciary: flag(set.fiduciary),
            bitcoin: flag(set.bitcoin),
            system: vec![SubnetSpec::default(); set.system],
            application: vec![SubnetSpec::default(); set.application],
            verified_application: vec![SubnetSpec::default(); set.verified_application],
        }
    }
}

impl ExtendedSubnetConfigSet {
    /// Adds a subnet of the given kind. A singleton kind replaces any earlier request.
    pub fn add(&mut self, kind: SubnetKind, spec: SubnetSpec) {
        match kind {
            SubnetKind::NNS => self.nns = Some(spec),
            SubnetKind::SNS => self.sns = Some(spec),
            SubnetKind::II => self.ii = Some(spec),
            SubnetKind::Fiduciary => self.fiduciary = Some(spec),
            SubnetKind::Bitcoin => self.bitcoin = Some(spec),
            SubnetKind::System => self.system.push(spec),
            SubnetKind::Application => self.application.push(spec),
            SubnetKind::VerifiedApplication => self.verified_application.push(spec),
        }
    }

    pub fn count(&self) -> usize {
        [&self.nns, &self.sns, &self.ii, &self.fiduciary, &self.bitcoin]
            .iter()
            .filter(|spec| spec.is_some())
            .count()
            + self.system.len()
            + self.application.len()
            + self.verified_application.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Every subnet with its kind, singletons first.
    pub fn specs(&self) -> Vec<(SubnetKind, &SubnetSpec)> {
        let singletons = [
            (SubnetKind::NNS, &self.nns),
            (SubnetKind::SNS, &self.sns),
            (SubnetKind::II, &self.ii),
            (SubnetKind::Fiduciary, &self.fiduciary),
            (SubnetKind::Bitcoin, &self.bitcoin),
        ];
        let singletons = singletons
            .into_iter()
            .filter_map(|(kind, spec)| spec.as_ref().map(|spec| (kind, spec)));
        let system = self.system.iter().map(|spec| (SubnetKind::System, spec));
        let application = self
            .application
            .iter()
            .map(|spec| (SubnetKind::Application, spec));
        let verified = self
            .verified_application
            .iter()
            .map(|spec| (SubnetKind::VerifiedApplication, spec));
        singletons
            .chain(system)
            .chain(application)
            .chain(verified)
            .collect()
    }
}

/// The body of a create-instance request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InstanceConfig {
    pub subnet_config_set: ExtendedSubnetConfigSet,
    pub state_dir: Option<PathBuf>,
    pub nonmainnet_features: bool,
    pub log_level: Option<String>,
    pub bitcoind_addr: Option<Vec<String>>,
}

impl InstanceConfig {
    /// Checks that the instance has something to run: at least one subnet, or a
    /// non-empty state directory to resume from.
    pub fn validate(&self) -> Result<(), PocketIcError> {
        let usable_state_dir = self
            .state_dir
            .as_deref()
            .map(is_non_empty_dir)
            .unwrap_or(false);
        if self.subnet_config_set.is_empty() && !usable_state_dir {
            return Err(PocketIcError::InvalidConfig(
                "at least one subnet or a non-empty state directory must be configured".into(),
            ));
        }
        Ok(())
    }
}

fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

// ================================================================================================================= //
// HTTP JSON Request types

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCanisterId {
    #[serde(with = "base64")]
    pub canister_id: Vec<u8>,
}

impl From<Principal> for RawCanisterId {
    fn from(principal: Principal) -> Self {
        Self {
            canister_id: principal.as_slice().to_vec(),
        }
    }
}

/// Routing hint for calls whose target has no placement yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawEffectivePrincipal {
    #[default]
    None,
    SubnetId(#[serde(with = "base64")] Vec<u8>),
    CanisterId(#[serde(with = "base64")] Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCanisterCall {
    #[serde(with = "base64")]
    pub sender: Vec<u8>,
    #[serde(with = "base64")]
    pub canister_id: Vec<u8>,
    pub effective_principal: RawEffectivePrincipal,
    pub method: String,
    #[serde(with = "base64")]
    pub payload: Vec<u8>,
}

/// Handle of a submitted but not yet awaited ingress message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessageId {
    pub effective_principal: RawEffectivePrincipal,
    #[serde(with = "base64")]
    pub message_id: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAddCycles {
    #[serde(with = "base64")]
    pub canister_id: Vec<u8>,
    pub amount: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSetStableMemory {
    #[serde(with = "base64")]
    pub canister_id: Vec<u8>,
    pub blob_id: BlobId,
}

// ================================================================================================================= //
// HTTP JSON Response types

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum CreateInstanceResponse {
    Created {
        instance_id: InstanceId,
        #[serde(default)]
        topology: Option<RawTopology>,
    },
    Error {
        message: String,
    },
}

/// Logical time of an instance, in nanoseconds since the Unix epoch.
///
/// Older servers split the value into `secs_since_epoch` plus a
/// `nanos_since_epoch` remainder; both shapes are accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RawTime {
    pub nanos_since_epoch: u64,
}

impl<'de> Deserialize<'de> for RawTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            secs_since_epoch: Option<u64>,
            nanos_since_epoch: u64,
        }
        let wire = Wire::deserialize(deserializer)?;
        let nanos_since_epoch = match wire.secs_since_epoch {
            None => wire.nanos_since_epoch,
            Some(secs) => secs
                .checked_mul(1_000_000_000)
                .and_then(|nanos| nanos.checked_add(wire.nanos_since_epoch))
                .ok_or_else(|| D::Error::custom("time overflows u64 nanoseconds"))?,
        };
        Ok(RawTime { nanos_since_epoch })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCycles {
    pub cycles: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStableMemory {
    #[serde(with = "base64")]
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSubnetId {
    #[serde(with = "base64")]
    pub subnet_id: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RawSubnetConfig {
    pub subnet_kind: SubnetKind,
}

/// The topology as returned by the server, keyed by textual subnet id.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawTopology {
    Nested {
        subnet_configs: BTreeMap<String, RawSubnetConfig>,
    },
    Flat(BTreeMap<String, RawSubnetConfig>),
}

/// Subnet id to subnet kind, as resolved by the server for one instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology(pub BTreeMap<Principal, SubnetKind>);

impl Topology {
    pub fn subnets_of_kind(&self, kind: SubnetKind) -> Vec<Principal> {
        self.0
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get_nns(&self) -> Option<Principal> {
        self.subnets_of_kind(SubnetKind::NNS).into_iter().next()
    }

    pub fn get_app_subnets(&self) -> Vec<Principal> {
        self.subnets_of_kind(SubnetKind::Application)
    }

    pub fn get_system_subnets(&self) -> Vec<Principal> {
        self.subnets_of_kind(SubnetKind::System)
    }

    pub fn kind_of(&self, subnet_id: &Principal) -> Option<SubnetKind> {
        self.0.get(subnet_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<RawTopology> for Topology {
    type Error = PocketIcError;

    fn try_from(raw: RawTopology) -> Result<Self, Self::Error> {
        let configs = match raw {
            RawTopology::Nested { subnet_configs } => subnet_configs,
            RawTopology::Flat(configs) => configs,
        };
        configs
            .into_iter()
            .map(|(subnet_id, config)| {
                Principal::from_text(&subnet_id)
                    .map(|id| (id, config.subnet_kind))
                    .map_err(|e| {
                        PocketIcError::protocol_violation(
                            format!("invalid subnet id in topology: {e}"),
                            &subnet_id,
                        )
                    })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Topology)
    }
}

// ================================================================================================================= //
// Blob store

/// SHA-256 of a blob stored on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlobId(pub [u8; 32]);

impl BlobId {
    /// Parses the hex text returned by the blob store.
    pub fn from_hex(text: &str) -> Result<Self, PocketIcError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| PocketIcError::protocol_violation(format!("invalid blob id: {e}"), text))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PocketIcError::protocol_violation("blob id is not 32 bytes", text))?;
        Ok(BlobId(hash))
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = base64::deserialize(deserializer)?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("blob id is not 32 bytes"))?;
        Ok(BlobId(hash))
    }
}

/// How an uploaded blob is encoded. The server decompresses gzip blobs itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlobCompression {
    #[default]
    NoCompression,
    Gzip,
}

impl BlobCompression {
    /// The `Content-Encoding` header value for uploads, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            BlobCompression::NoCompression => None,
            BlobCompression::Gzip => Some("gzip"),
        }
    }
}

impl FromStr for BlobCompression {
    type Err = PocketIcError;

    fn from_str(scheme: &str) -> Result<Self, Self::Err> {
        match scheme {
            "gzip" => Ok(BlobCompression::Gzip),
            other => Err(PocketIcError::UnsupportedCompression(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn singleton_kinds_deduplicate() {
        let mut set = ExtendedSubnetConfigSet::default();
        set.add(SubnetKind::NNS, SubnetSpec::default());
        set.add(SubnetKind::NNS, SubnetSpec::default());
        set.add(SubnetKind::Bitcoin, SubnetSpec::default());
        set.add(SubnetKind::Bitcoin, SubnetSpec::default());
        set.add(SubnetKind::Application, SubnetSpec::default());
        set.add(SubnetKind::Application, SubnetSpec::default());
        assert_eq!(set.count(), 4);
        let kinds: Vec<_> = set.specs().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            vec![
                SubnetKind::NNS,
                SubnetKind::Bitcoin,
                SubnetKind::Application,
                SubnetKind::Application
            ]
        );
    }

    #[test]
    fn only_application_and_system_kinds_repeat() {
        use strum::IntoEnumIterator;
        let repeatable: Vec<_> = SubnetKind::iter().filter(|k| !k.is_singleton()).collect();
        assert_eq!(
            repeatable,
            vec![
                SubnetKind::Application,
                SubnetKind::System,
                SubnetKind::VerifiedApplication
            ]
        );
    }

    #[test]
    fn instance_config_json_shape() {
        let mut set: ExtendedSubnetConfigSet = SubnetConfigSet {
            application: 1,
            ..Default::default()
        }
        .into();
        set.add(
            SubnetKind::NNS,
            SubnetSpec::default().with_state_dir_and_id(
                PathBuf::from("/tmp/nns"),
                Principal::from_slice(&[1, 2, 3]),
            ),
        );
        set.add(
            SubnetKind::SNS,
            SubnetSpec::default().with_state_dir(PathBuf::from("/tmp/sns")),
        );
        let config = InstanceConfig {
            subnet_config_set: set,
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value["subnet_config_set"]["application"],
            json!([{"state_config": "New", "instruction_config": "Production"}])
        );
        assert_eq!(
            value["subnet_config_set"]["nns"]["state_config"],
            json!({"FromPath": ["/tmp/nns", {"subnet_id": "AQID"}]})
        );
        assert_eq!(
            value["subnet_config_set"]["sns"]["state_config"],
            json!({"FromPath": "/tmp/sns"})
        );
        assert_eq!(value["subnet_config_set"]["ii"], json!(null));
        assert_eq!(value["state_dir"], json!(null));
        assert_eq!(value["nonmainnet_features"], json!(false));
    }

    #[test]
    fn validation_requires_a_subnet_or_state() {
        assert_matches::assert_matches!(
            InstanceConfig::default().validate(),
            Err(PocketIcError::InvalidConfig(_))
        );

        let empty_dir = tempfile::tempdir().unwrap();
        let config = InstanceConfig {
            state_dir: Some(empty_dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        std::fs::write(empty_dir.path().join("topology.json"), b"{}").unwrap();
        assert!(config.validate().is_ok());

        let config = InstanceConfig {
            subnet_config_set: SubnetConfigSet {
                system: 1,
                ..Default::default()
            }
            .into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn time_accepts_both_representations() {
        let flat: RawTime = serde_json::from_str(r#"{"nanos_since_epoch": 1704067199999999999}"#)
            .unwrap();
        let split: RawTime = serde_json::from_str(
            r#"{"secs_since_epoch": 1704067199, "nanos_since_epoch": 999999999}"#,
        )
        .unwrap();
        assert_eq!(flat, split);
    }

    #[test]
    fn topology_accepts_flat_and_nested_shapes() {
        let nns = Principal::from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let flat: RawTopology = serde_json::from_value(json!({
            nns.to_text(): {"subnet_kind": "NNS", "size": 40}
        }))
        .unwrap();
        let nested: RawTopology = serde_json::from_value(json!({
            "subnet_configs": {nns.to_text(): {"subnet_kind": "NNS"}},
            "default_effective_canister_id": {"canister_id": "AAAAAAAAAAEBAQ=="}
        }))
        .unwrap();
        let flat = Topology::try_from(flat).unwrap();
        assert_eq!(flat, Topology::try_from(nested).unwrap());
        assert_eq!(flat.get_nns(), Some(nns));
        assert!(flat.get_app_subnets().is_empty());
    }

    #[test]
    fn compression_schemes() {
        assert_eq!(
            "gzip".parse::<BlobCompression>().unwrap(),
            BlobCompression::Gzip
        );
        assert_matches::assert_matches!(
            "zstd".parse::<BlobCompression>(),
            Err(PocketIcError::UnsupportedCompression(scheme)) if scheme == "zstd"
        );
    }

    #[test]
    fn effective_principal_wire_shape() {
        assert_eq!(
            serde_json::to_value(RawEffectivePrincipal::None).unwrap(),
            json!("None")
        );
        assert_eq!(
            serde_json::to_value(RawEffectivePrincipal::SubnetId(vec![1, 2, 3])).unwrap(),
            json!({"SubnetId": "AQID"})
        );
    }
}
