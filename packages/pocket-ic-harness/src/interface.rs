//! Calling canisters through their candid interface.
//!
//! An [`Interface`] is parsed once from a `.did` document into a registry of
//! [`MethodDescriptor`]s. A [`Canister`] pairs an interface with a canister id
//! and an instance, and [`Canister::invoke`] is the single entry point that
//! checks arity, encodes the arguments against the declared types, dispatches
//! as query or update, and decodes the reply against the declared result types.
//!
//! ```ignore
//! let pic = PocketIc::new()?;
//! let counter = pic.create_and_install_canister_with_candid(DID, wasm, None, None)?;
//! counter.invoke("set", &[IDLValue::Nat(42u64.into())])?;
//! assert_eq!(counter.invoke("get", &[])?, vec![IDLValue::Nat(42u64.into())]);
//! ```

use crate::error::PocketIcError;
use crate::protocol::Reply;
use crate::PocketIc;
use candid::{
    types::{FuncMode, Type, TypeInner},
    IDLArgs, IDLValue, Principal, TypeEnv,
};
use candid_parser::utils::CandidSource;
use std::{collections::BTreeMap, path::Path, sync::Arc};

/// How a method is dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// Annotated `query` or `composite_query`; sent to the read-only endpoint.
    Query,
    /// Everything else, including unannotated methods.
    Update,
}

/// The signature of one method of a service.
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub name: String,
    pub args: Vec<Type>,
    pub rets: Vec<Type>,
    pub mode: CallMode,
}

impl MethodDescriptor {
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

/// A parsed candid service.
///
/// Methods are kept in name order, the canonical order of a candid service
/// type. The declaration order of the document is not preserved.
#[derive(Clone, Debug)]
pub struct Interface {
    env: TypeEnv,
    init_args: Vec<Type>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl Interface {
    /// Parses a `.did` document. The document must declare a service whose
    /// constructor, if any, takes at most one argument.
    pub fn parse(did: &str) -> Result<Self, PocketIcError> {
        let (env, actor) = CandidSource::Text(did)
            .load()
            .map_err(|e| PocketIcError::MalformedInterface(e.to_string()))?;
        let actor = actor.ok_or_else(|| {
            PocketIcError::MalformedInterface("the document declares no service".to_string())
        })?;

        let init_args = match actor.as_ref() {
            TypeInner::Class(init_args, _) => init_args.clone(),
            _ => Vec::new(),
        };
        if init_args.len() > 1 {
            return Err(PocketIcError::MalformedInterface(format!(
                "the service constructor takes {} arguments, at most one is supported",
                init_args.len()
            )));
        }

        let service = env
            .as_service(&actor)
            .map_err(|e| PocketIcError::MalformedInterface(e.to_string()))?;
        let mut methods = BTreeMap::new();
        for (name, ty) in service {
            let func = env
                .as_func(ty)
                .map_err(|e| PocketIcError::MalformedInterface(e.to_string()))?;
            let mode = if func
                .modes
                .iter()
                .any(|mode| matches!(mode, FuncMode::Query | FuncMode::CompositeQuery))
            {
                CallMode::Query
            } else {
                CallMode::Update
            };
            methods.insert(
                name.clone(),
                MethodDescriptor {
                    name: name.clone(),
                    args: func.args.clone(),
                    rets: func.rets.clone(),
                    mode,
                },
            );
        }

        Ok(Self {
            env,
            init_args,
            methods,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, PocketIcError> {
        let did = std::fs::read_to_string(path).map_err(|e| {
            PocketIcError::MalformedInterface(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&did)
    }

    pub fn env(&self) -> &TypeEnv {
        &self.env
    }

    /// The methods, ordered by name regardless of declaration order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    pub fn method(&self, name: &str) -> Result<&MethodDescriptor, PocketIcError> {
        self.methods
            .get(name)
            .ok_or_else(|| PocketIcError::UnknownMethod(name.to_string()))
    }

    /// The constructor argument type, if the service takes one.
    pub fn init_type(&self) -> Option<&Type> {
        self.init_args.first()
    }

    /// Encodes the install argument. A service without a constructor argument
    /// gets the empty argument list; otherwise a missing value is sent as `null`.
    pub fn encode_init_arg(&self, arg: Option<IDLValue>) -> Result<Vec<u8>, PocketIcError> {
        match (self.init_args.as_slice(), arg) {
            ([], None) => Ok(candid::encode_args(())?),
            ([], Some(_)) => Err(PocketIcError::ArityMismatch {
                method: "init".to_string(),
                expected: 0,
                actual: 1,
            }),
            (types, arg) => {
                let value = arg.unwrap_or(IDLValue::Null);
                Ok(IDLArgs::new(&[value]).to_bytes_with_types(&self.env, types)?)
            }
        }
    }

    /// Encodes positional arguments against the declared argument types.
    pub fn encode_args(
        &self,
        method: &MethodDescriptor,
        args: &[IDLValue],
    ) -> Result<Vec<u8>, PocketIcError> {
        if args.len() != method.arity() {
            return Err(PocketIcError::ArityMismatch {
                method: method.name.clone(),
                expected: method.arity(),
                actual: args.len(),
            });
        }
        Ok(IDLArgs::new(args).to_bytes_with_types(&self.env, &method.args)?)
    }

    /// Decodes a reply against the declared result types into one value per
    /// result. A non-candid reply is returned as a single byte vector.
    pub fn decode_reply(
        &self,
        method: &MethodDescriptor,
        reply: Reply,
    ) -> Result<Vec<IDLValue>, PocketIcError> {
        match reply {
            Reply::Candid(bytes) => {
                Ok(IDLArgs::from_bytes_with_types(&bytes, &self.env, &method.rets)?.args)
            }
            Reply::Bytes(bytes) => Ok(vec![IDLValue::Vec(
                bytes.into_iter().map(IDLValue::Nat8).collect(),
            )]),
        }
    }
}

/// A canister on an instance, callable through its interface.
#[derive(Clone)]
pub struct Canister<'a> {
    pic: &'a PocketIc,
    canister_id: Principal,
    interface: Arc<Interface>,
}

impl<'a> Canister<'a> {
    pub fn new(pic: &'a PocketIc, canister_id: Principal, interface: Arc<Interface>) -> Self {
        Self {
            pic,
            canister_id,
            interface,
        }
    }

    pub fn canister_id(&self) -> Principal {
        self.canister_id
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn method(&self, name: &str) -> Result<BoundMethod<'_>, PocketIcError> {
        let descriptor = self.interface.method(name)?;
        Ok(BoundMethod {
            canister: self,
            descriptor,
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = BoundMethod<'_>> {
        self.interface
            .methods()
            .map(move |descriptor| BoundMethod {
                canister: self,
                descriptor,
            })
    }

    /// Calls `method` with positional arguments as the instance's current sender.
    pub fn invoke(&self, method: &str, args: &[IDLValue]) -> Result<Vec<IDLValue>, PocketIcError> {
        self.method(method)?.call(args)
    }

    /// Like [`Self::invoke`], with arguments in candid text form, e.g. `"(42, \"x\")"`.
    pub fn invoke_text(&self, method: &str, args: &str) -> Result<Vec<IDLValue>, PocketIcError> {
        self.method(method)?.call_text(args)
    }
}

impl std::fmt::Debug for Canister<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canister")
            .field("instance_id", &self.pic.instance_id())
            .field("canister_id", &self.canister_id.to_text())
            .finish()
    }
}

/// One method of a [`Canister`].
#[derive(Clone, Copy)]
pub struct BoundMethod<'a> {
    canister: &'a Canister<'a>,
    descriptor: &'a MethodDescriptor,
}

impl BoundMethod<'_> {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        self.descriptor
    }

    pub fn call(&self, args: &[IDLValue]) -> Result<Vec<IDLValue>, PocketIcError> {
        let canister = self.canister;
        let payload = canister.interface.encode_args(self.descriptor, args)?;
        let target = Some(canister.canister_id);
        let reply = match self.descriptor.mode {
            CallMode::Query => canister.pic.query_call(target, self.name(), payload)?,
            CallMode::Update => canister.pic.update_call(target, self.name(), payload)?,
        };
        canister.interface.decode_reply(self.descriptor, reply)
    }

    pub fn call_text(&self, args: &str) -> Result<Vec<IDLValue>, PocketIcError> {
        let args = candid_parser::parse_idl_args(args)
            .map_err(|e| PocketIcError::InvalidArguments(e.to_string()))?;
        self.call(&args.args)
    }
}
