//! Canister calls: the update/query primitives, two-phase submit/await, and the
//! management canister operations built on them.

use crate::common::rest::{RawCanisterCall, RawEffectivePrincipal, RawMessageId};
use crate::error::{ErrorCode, PocketIcError};
use crate::management_canister::{
    CanisterIdRecord, CanisterInstallMode, CanisterSettings, InstallCodeArgs,
    ProvisionalCreateCanisterWithCyclesArgs,
};
use crate::protocol::{split_envelope, unwrap_call_result, Reply, WireProtocol};
use crate::PocketIc;
use candid::{decode_one, encode_one, Principal};
use tracing::debug;

/// Routing hint for management canister calls whose target has no placement yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EffectivePrincipal {
    #[default]
    None,
    SubnetId(Principal),
    CanisterId(Principal),
}

impl From<EffectivePrincipal> for RawEffectivePrincipal {
    fn from(effective_principal: EffectivePrincipal) -> Self {
        match effective_principal {
            EffectivePrincipal::None => RawEffectivePrincipal::None,
            EffectivePrincipal::SubnetId(subnet_id) => {
                RawEffectivePrincipal::SubnetId(subnet_id.as_slice().to_vec())
            }
            EffectivePrincipal::CanisterId(canister_id) => {
                RawEffectivePrincipal::CanisterId(canister_id.as_slice().to_vec())
            }
        }
    }
}

/// The management canister operations that need an effective principal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ManagementOperation {
    CreateCanister {
        subnet_id: Option<Principal>,
        specified_id: Option<Principal>,
    },
    InstallCode {
        canister_id: Principal,
    },
}

impl ManagementOperation {
    /// Code installation targets a placed canister and always routes by it.
    /// Creation routes by a requested canister id first, then by a requested
    /// subnet, and carries no hint otherwise.
    pub(crate) fn effective_principal(self) -> EffectivePrincipal {
        match self {
            ManagementOperation::InstallCode { canister_id } => {
                EffectivePrincipal::CanisterId(canister_id)
            }
            ManagementOperation::CreateCanister {
                specified_id: Some(canister_id),
                ..
            } => EffectivePrincipal::CanisterId(canister_id),
            ManagementOperation::CreateCanister {
                subnet_id: Some(subnet_id),
                specified_id: None,
            } => EffectivePrincipal::SubnetId(subnet_id),
            ManagementOperation::CreateCanister {
                subnet_id: None,
                specified_id: None,
            } => EffectivePrincipal::None,
        }
    }
}

impl PocketIc {
    /// Executes an update call as the current sender. `None` targets the
    /// management canister.
    pub fn update_call(
        &self,
        canister_id: Option<Principal>,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Reply, PocketIcError> {
        self.update_call_with_effective_principal(
            canister_id,
            EffectivePrincipal::None,
            method,
            payload,
        )
    }

    /// Executes an update call with an explicit routing hint.
    ///
    /// With [`WireProtocol::SubmitAwait`] this submits the message and awaits it
    /// in two round trips; deleting the instance in between has no defined outcome.
    pub fn update_call_with_effective_principal(
        &self,
        canister_id: Option<Principal>,
        effective_principal: EffectivePrincipal,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Reply, PocketIcError> {
        match self.server.protocol() {
            WireProtocol::Synchronous => {
                let body = self.canister_call(
                    "update/execute_ingress_message",
                    canister_id,
                    effective_principal,
                    method,
                    payload,
                )?;
                unwrap_call_result(WireProtocol::Synchronous, &body)
            }
            WireProtocol::SubmitAwait => {
                let message_id =
                    self.submit_call(canister_id, effective_principal, method, payload)?;
                self.await_call(message_id)
            }
        }
    }

    /// Executes a query call as the current sender. `None` targets the
    /// management canister.
    pub fn query_call(
        &self,
        canister_id: Option<Principal>,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Reply, PocketIcError> {
        let body = self.canister_call(
            "read/query",
            canister_id,
            EffectivePrincipal::None,
            method,
            payload,
        )?;
        unwrap_call_result(self.server.protocol(), &body)
    }

    /// Submits an update call without executing it.
    pub fn submit_call(
        &self,
        canister_id: Option<Principal>,
        effective_principal: EffectivePrincipal,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<RawMessageId, PocketIcError> {
        let body = self.canister_call(
            "update/submit_ingress_message",
            canister_id,
            effective_principal,
            method,
            payload,
        )?;
        match split_envelope(&body)? {
            Ok(message_id) => serde_json::from_value(message_id).map_err(|e| {
                PocketIcError::protocol_violation(format!("invalid message id: {e}"), &body)
            }),
            Err(reject) => Err(PocketIcError::Rejected(reject)),
        }
    }

    /// Executes a submitted update call and returns its result.
    pub fn await_call(&self, message_id: RawMessageId) -> Result<Reply, PocketIcError> {
        self.ensure_live()?;
        let body = self.server.instance_post_text(
            self.instance_id,
            "update/await_ingress_message",
            &message_id,
        )?;
        unwrap_call_result(self.server.protocol(), &body)
    }

    fn canister_call(
        &self,
        endpoint: &str,
        canister_id: Option<Principal>,
        effective_principal: EffectivePrincipal,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<String, PocketIcError> {
        self.ensure_live()?;
        let canister_id = canister_id.unwrap_or_else(Principal::management_canister);
        debug!(%canister_id, method, endpoint, "canister call");
        let raw_canister_call = RawCanisterCall {
            sender: self.sender().as_slice().to_vec(),
            canister_id: canister_id.as_slice().to_vec(),
            effective_principal: effective_principal.into(),
            method: method.to_string(),
            payload,
        };
        self.server
            .instance_post_text(self.instance_id, endpoint, &raw_canister_call)
    }

    /// Creates an empty canister with default settings.
    pub fn create_canister(&self) -> Result<Principal, PocketIcError> {
        self.create_canister_with_settings(None)
    }

    pub fn create_canister_with_settings(
        &self,
        settings: Option<CanisterSettings>,
    ) -> Result<Principal, PocketIcError> {
        self.provisional_create_canister(settings, None, None)
    }

    /// Creates an empty canister on the given subnet.
    pub fn create_canister_on_subnet(
        &self,
        settings: Option<CanisterSettings>,
        subnet_id: Principal,
    ) -> Result<Principal, PocketIcError> {
        self.provisional_create_canister(settings, Some(subnet_id), None)
    }

    /// Creates an empty canister with a chosen id.
    ///
    /// Fails with [`PocketIcError::CanisterAlreadyExists`] if the id is taken and
    /// with [`PocketIcError::CanisterNotHosted`] if no subnet of the instance
    /// covers it.
    pub fn create_canister_with_id(
        &self,
        settings: Option<CanisterSettings>,
        canister_id: Principal,
    ) -> Result<Principal, PocketIcError> {
        self.provisional_create_canister(settings, None, Some(canister_id))
    }

    fn provisional_create_canister(
        &self,
        settings: Option<CanisterSettings>,
        subnet_id: Option<Principal>,
        specified_id: Option<Principal>,
    ) -> Result<Principal, PocketIcError> {
        let effective_principal = ManagementOperation::CreateCanister {
            subnet_id,
            specified_id,
        }
        .effective_principal();
        let payload = encode_one(ProvisionalCreateCanisterWithCyclesArgs {
            settings,
            specified_id,
            amount: None,
            sender_canister_version: None,
        })?;
        let reply = self
            .update_call_with_effective_principal(
                None,
                effective_principal,
                "provisional_create_canister_with_cycles",
                payload,
            )
            .map_err(|err| describe_creation_error(err, specified_id))?;
        match reply {
            Reply::Candid(bytes) => {
                let CanisterIdRecord { canister_id } = decode_one(&bytes)?;
                Ok(canister_id)
            }
            Reply::Bytes(bytes) => Err(PocketIcError::protocol_violation(
                "canister creation replied without a candid record",
                hex::encode(bytes),
            )),
        }
    }

    /// Installs a wasm module on an empty canister. `arg` is the candid-encoded
    /// init argument.
    pub fn install_canister(
        &self,
        canister_id: Principal,
        wasm_module: Vec<u8>,
        arg: Vec<u8>,
    ) -> Result<(), PocketIcError> {
        let effective_principal =
            ManagementOperation::InstallCode { canister_id }.effective_principal();
        let payload = encode_one(InstallCodeArgs {
            arg,
            wasm_module,
            mode: CanisterInstallMode::Install,
            canister_id,
            sender_canister_version: None,
        })?;
        self.update_call_with_effective_principal(
            None,
            effective_principal,
            "install_code",
            payload,
        )?;
        Ok(())
    }
}

fn describe_creation_error(err: PocketIcError, specified_id: Option<Principal>) -> PocketIcError {
    let (PocketIcError::Rejected(reject), Some(canister_id)) = (&err, specified_id) else {
        return err;
    };
    match reject.error_code {
        ErrorCode::CanisterAlreadyInstalled | ErrorCode::CanisterIdAlreadyExists => {
            PocketIcError::CanisterAlreadyExists {
                canister_id,
                reject: reject.clone(),
            }
        }
        ErrorCode::CanisterNotHostedBySubnet => PocketIcError::CanisterNotHosted {
            canister_id,
            reject: reject.clone(),
        },
        _ => err,
    }
}
