use crate::{
    error::RegistryError,
    types::{Type, TypeMismatch, Value},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Identifies a contract: interface name plus version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
    pub version: u32,
}

impl ServiceId {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<Type>,
    pub returns: Type,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, params: Vec<Type>, returns: Type) -> Self {
        Self {
            name: name.into(),
            params,
            returns,
        }
    }

    pub fn check_args(&self, args: &[Value]) -> Result<(), TypeMismatch> {
        if args.len() != self.params.len() {
            return Err(TypeMismatch::Arity {
                expected: self.params.len(),
                found: args.len(),
            });
        }
        self.params
            .iter()
            .zip(args)
            .try_for_each(|(ty, arg)| ty.check(arg))
    }

    pub fn check_return(&self, value: &Value) -> Result<(), TypeMismatch> {
        self.returns.check(value)
    }
}

/// A contract: its identifier and its methods, indexed by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    id: ServiceId,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(id: ServiceId, methods: Vec<MethodDescriptor>) -> Self {
        Self { id, methods }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn method(&self, index: u32) -> Result<&MethodDescriptor, RegistryError> {
        self.methods
            .get(index as usize)
            .ok_or_else(|| RegistryError::UnknownMethod {
                service: self.id.clone(),
                index,
            })
    }

    /// Maps a method name to its index. The first method with that name wins.
    pub fn method_index(&self, name: &str) -> Result<u32, RegistryError> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| RegistryError::UnknownMethodName {
                service: self.id.clone(),
                name: name.to_owned(),
            })
    }
}

/// Maps [`ServiceId`]s to their [`ServiceDescriptor`].
///
/// Contracts are registered with [`register`](Self::register) while the
/// registry is still exclusively owned. Afterwards it is shared behind an
/// `Arc` and only ever read, so lookups need no locking.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    services: BTreeMap<ServiceId, ServiceDescriptor>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        if self.services.contains_key(descriptor.id()) {
            return Err(RegistryError::DuplicateService(descriptor.id().clone()));
        }
        self.services.insert(descriptor.id().clone(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, id: &ServiceId) -> Result<&ServiceDescriptor, RegistryError> {
        self.services
            .get(id)
            .ok_or_else(|| RegistryError::UnknownService(id.clone()))
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }
}
