//! Candid records of the management canister methods the harness calls.

use candid::{CandidType, Deserialize, Principal};

pub type CanisterId = Principal;
pub type SubnetId = Principal;

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanisterIdRecord {
    pub canister_id: CanisterId,
}

// canister settings

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum LogVisibility {
    #[serde(rename = "controllers")]
    Controllers,
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "allowed_viewers")]
    AllowedViewers(Vec<Principal>),
}

#[derive(CandidType, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CanisterSettings {
    pub freezing_threshold: Option<candid::Nat>,
    pub controllers: Option<Vec<Principal>>,
    pub reserved_cycles_limit: Option<candid::Nat>,
    pub log_visibility: Option<LogVisibility>,
    pub wasm_memory_limit: Option<candid::Nat>,
    pub memory_allocation: Option<candid::Nat>,
    pub compute_allocation: Option<candid::Nat>,
}

// canister creation

#[derive(CandidType, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionalCreateCanisterWithCyclesArgs {
    pub settings: Option<CanisterSettings>,
    pub specified_id: Option<CanisterId>,
    pub amount: Option<candid::Nat>,
    pub sender_canister_version: Option<u64>,
}

// canister code installation

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CanisterInstallModeUpgradeInnerWasmMemoryPersistenceInner {
    #[serde(rename = "keep")]
    Keep,
    #[serde(rename = "replace")]
    Replace,
}

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanisterInstallModeUpgradeInner {
    pub wasm_memory_persistence: Option<CanisterInstallModeUpgradeInnerWasmMemoryPersistenceInner>,
    pub skip_pre_upgrade: Option<bool>,
}

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CanisterInstallMode {
    #[serde(rename = "reinstall")]
    Reinstall,
    #[serde(rename = "upgrade")]
    Upgrade(Option<CanisterInstallModeUpgradeInner>),
    #[serde(rename = "install")]
    Install,
}

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallCodeArgs {
    #[serde(with = "serde_bytes")]
    pub arg: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub wasm_module: Vec<u8>,
    pub mode: CanisterInstallMode,
    pub canister_id: CanisterId,
    pub sender_canister_version: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candid::{decode_one, encode_one, IDLArgs};

    #[test]
    fn install_args_decode_as_sent() {
        let args = InstallCodeArgs {
            arg: vec![],
            wasm_module: b"\0asm".to_vec(),
            mode: CanisterInstallMode::Install,
            canister_id: Principal::management_canister(),
            sender_canister_version: None,
        };
        let bytes = encode_one(&args).unwrap();
        assert_eq!(decode_one::<InstallCodeArgs>(&bytes).unwrap(), args);
    }

    #[test]
    fn create_args_with_a_specified_id() {
        let specified_id = Principal::from_text("rwlgt-iiaaa-aaaaa-aaaaa-cai").unwrap();
        let args = ProvisionalCreateCanisterWithCyclesArgs {
            specified_id: Some(specified_id),
            ..Default::default()
        };
        let text = IDLArgs::from_bytes(&encode_one(&args).unwrap())
            .unwrap()
            .to_string();
        assert!(text.contains("rwlgt-iiaaa-aaaaa-aaaaa-cai"), "{text}");
    }
}
