use crate::{
    codec::{self, CallRequest, CallResponse, Frame, FrameKind, Outcome},
    contract::{ContractRegistry, MethodDescriptor, ServiceId},
    error::{ApplicationError, CodecError, ProtocolFault, RegistryError},
    types::{Decode, TypeMismatch, Value},
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc, vec};

/// A concrete implementation of a contract, bound on the server.
///
/// `args` have already been checked against the method's declared parameter
/// types by the time `call` runs, and `method_index` is in range.
pub trait RpcService: Send + Sync + 'static {
    fn call(
        &self,
        method_index: u32,
        args: Arguments,
    ) -> BoxFuture<'_, Result<Value, ApplicationError>>;
}

/// Positional access to a call's arguments.
#[derive(Debug)]
pub struct Arguments {
    values: vec::IntoIter<Value>,
    taken: usize,
}

impl Arguments {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
            taken: 0,
        }
    }

    /// Decodes the next argument.
    pub fn next<T: Decode>(&mut self) -> Result<T, TypeMismatch> {
        let value = self.values.next().ok_or(TypeMismatch::Arity {
            expected: self.taken + 1,
            found: self.taken,
        })?;
        self.taken += 1;
        T::decode(value)
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

/// Maps service ids to the object that fulfils them.
///
/// Lookups clone the `Arc` and release the lock before the implementation is
/// invoked, so binding never waits on a running call.
#[derive(Default)]
pub struct ImplementationRegistry {
    bound: RwLock<HashMap<ServiceId, Arc<dyn RpcService>>>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, id: ServiceId, service: Arc<dyn RpcService>) -> Result<(), RegistryError> {
        let mut bound = self.bound.write();
        if bound.contains_key(&id) {
            return Err(RegistryError::AlreadyBound(id));
        }
        tracing::debug!(service = %id, "implementation bound");
        bound.insert(id, service);
        Ok(())
    }

    pub fn unbind(&self, id: &ServiceId) -> Result<Arc<dyn RpcService>, RegistryError> {
        self.bound
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NoImplementationBound(id.clone()))
    }

    pub fn lookup(&self, id: &ServiceId) -> Result<Arc<dyn RpcService>, RegistryError> {
        self.bound
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NoImplementationBound(id.clone()))
    }

    pub fn bound(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self.bound.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Resolves requests against the contract and implementation registries and
/// invokes the bound implementation.
pub struct Dispatcher {
    contracts: Arc<ContractRegistry>,
    implementations: ImplementationRegistry,
}

impl Dispatcher {
    pub fn new(contracts: Arc<ContractRegistry>) -> Self {
        Self {
            contracts,
            implementations: ImplementationRegistry::new(),
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn implementations(&self) -> &ImplementationRegistry {
        &self.implementations
    }

    /// Binds `service` to a contract that must already be registered.
    pub fn bind<S: RpcService>(&self, id: ServiceId, service: S) -> Result<(), RegistryError> {
        self.contracts.resolve(&id)?;
        self.implementations.bind(id, Arc::new(service))
    }

    /// Answers one request frame. Always yields exactly one response frame.
    pub async fn dispatch_frame(&self, frame: &Frame) -> Frame {
        let response = match frame.kind() {
            Ok(FrameKind::Ping) => return Frame::pong(frame.call_id),
            Ok(FrameKind::Request) => match codec::decode_request(frame) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => self.reject(frame, err),
            },
            Ok(kind) => self.reject(
                frame,
                CodecError::MalformedFrame(format!("server cannot handle a {kind:?} frame")),
            ),
            Err(err) => self.reject(frame, err),
        };

        match codec::encode_response(&response) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(call_id = response.call_id, error = %err, "failed to encode response");
                let fallback = CallResponse {
                    call_id: response.call_id,
                    service: response.service,
                    outcome: Outcome::ProtocolError(ProtocolFault::Internal(err.to_string())),
                };
                codec::encode_response(&fallback).unwrap_or_else(|_| Frame {
                    call_id: fallback.call_id,
                    kind: FrameKind::Response as u8,
                    service: fallback.service,
                    selector: u32::MAX,
                    payload: Vec::new(),
                })
            }
        }
    }

    fn reject(&self, frame: &Frame, err: CodecError) -> CallResponse {
        tracing::warn!(call_id = frame.call_id, error = %err, "rejecting undecodable request");
        CallResponse {
            call_id: frame.call_id,
            service: frame.service.clone(),
            outcome: Outcome::ProtocolError(err.into()),
        }
    }

    pub async fn dispatch(&self, request: CallRequest) -> CallResponse {
        let call_id = request.call_id;
        let service = request.service.clone();
        let outcome = match self.resolve(&request) {
            Ok((implementation, method)) => self.invoke(implementation, method, request).await,
            Err(fault) => {
                tracing::debug!(call_id, service = %service, method = request.method_index, %fault, "cannot dispatch request");
                Outcome::ProtocolError(fault)
            }
        };
        CallResponse {
            call_id,
            service,
            outcome,
        }
    }

    fn resolve(
        &self,
        request: &CallRequest,
    ) -> Result<(Arc<dyn RpcService>, &MethodDescriptor), ProtocolFault> {
        let descriptor = self.contracts.resolve(&request.service)?;
        let implementation = self.implementations.lookup(&request.service)?;
        let method = codec::typecheck_request(descriptor, request)?;
        Ok((implementation, method))
    }

    async fn invoke(
        &self,
        implementation: Arc<dyn RpcService>,
        method: &MethodDescriptor,
        request: CallRequest,
    ) -> Outcome {
        let CallRequest {
            call_id,
            service,
            method_index,
            args,
            ..
        } = request;
        tracing::debug!(call_id, service = %service, method = %method.name, "invoking implementation");

        // Building the future runs implementation code too, so it is guarded
        // along with the polling.
        let call = async move { implementation.call(method_index, Arguments::new(args)).await };
        let value = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Outcome::ApplicationError(err),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(call_id, service = %service, method = %method.name, %message, "implementation panicked");
                return Outcome::ApplicationError(ApplicationError::new(format!(
                    "implementation panicked: {message}"
                )));
            }
        };

        match method.check_return(&value) {
            Ok(()) => Outcome::Success(value),
            Err(mismatch) => {
                tracing::error!(call_id, service = %service, method = %method.name, %mismatch, "implementation returned a value of the wrong type");
                Outcome::ProtocolError(ProtocolFault::TypeMismatch(mismatch))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{service, types::Type};

    struct Calculator;

    impl RpcService for Calculator {
        fn call(
            &self,
            method_index: u32,
            mut args: Arguments,
        ) -> BoxFuture<'_, Result<Value, ApplicationError>> {
            Box::pin(async move {
                match method_index {
                    0 => {
                        let a: i64 = args.next()?;
                        let b: i64 = args.next()?;
                        Ok(Value::Int(a + b))
                    }
                    1 => {
                        let a: i64 = args.next()?;
                        let b: i64 = args.next()?;
                        if b == 0 {
                            return Err("division by zero".into());
                        }
                        Ok(Value::Int(a / b))
                    }
                    2 => panic!("boom"),
                    _ => Ok(Value::from("not an int")),
                }
            })
        }
    }

    /// Does its work before handing back a future.
    struct Eager;

    impl RpcService for Eager {
        fn call(
            &self,
            _method_index: u32,
            mut args: Arguments,
        ) -> BoxFuture<'_, Result<Value, ApplicationError>> {
            let n: i64 = args.next().unwrap_or_default();
            if n < 0 {
                panic!("negative input {n}");
            }
            futures::future::ready(Ok(Value::Int(n))).boxed()
        }
    }

    fn calculator_id() -> ServiceId {
        ServiceId::new("Calculator", 1)
    }

    fn dispatcher() -> Dispatcher {
        let mut contracts = ContractRegistry::new();
        contracts
            .register(service!("Calculator" @ 1 {
                "add"(Type::Int, Type::Int) -> Type::Int;
                "div"(Type::Int, Type::Int) -> Type::Int;
                "explode"() -> Type::Int;
                "lie"() -> Type::Int;
            }))
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(contracts));
        dispatcher.bind(calculator_id(), Calculator).unwrap();
        dispatcher
    }

    fn request(method_index: u32, args: Vec<Value>) -> CallRequest {
        CallRequest::new(1, calculator_id(), method_index, args)
    }

    #[tokio::test]
    async fn successful_call() {
        let response = dispatcher()
            .dispatch(request(0, vec![Value::Int(2), Value::Int(3)]))
            .await;
        assert_eq!(response.call_id, 1);
        assert_eq!(response.outcome, Outcome::Success(Value::Int(5)));
    }

    #[tokio::test]
    async fn implementation_errors_are_application_errors() {
        let response = dispatcher()
            .dispatch(request(1, vec![Value::Int(2), Value::Int(0)]))
            .await;
        assert_eq!(
            response.outcome,
            Outcome::ApplicationError("division by zero".into())
        );
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let response = dispatcher().dispatch(request(2, vec![])).await;
        let Outcome::ApplicationError(err) = response.outcome else {
            panic!("expected an application error, got {:?}", response.outcome);
        };
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn panics_while_building_the_call_are_captured() {
        let mut contracts = ContractRegistry::new();
        let eager_id = ServiceId::new("Eager", 1);
        contracts
            .register(service!("Eager" @ 1 { "check"(Type::Int) -> Type::Int; }))
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(contracts));
        dispatcher.bind(eager_id.clone(), Eager).unwrap();

        let response = dispatcher
            .dispatch(CallRequest::new(4, eager_id.clone(), 0, vec![Value::Int(-1)]))
            .await;
        assert_eq!(response.call_id, 4);
        let Outcome::ApplicationError(err) = response.outcome else {
            panic!("expected an application error, got {:?}", response.outcome);
        };
        assert!(err.message.contains("negative input -1"));

        let response = dispatcher
            .dispatch(CallRequest::new(5, eager_id, 0, vec![Value::Int(3)]))
            .await;
        assert_eq!(response.outcome, Outcome::Success(Value::Int(3)));
    }

    #[tokio::test]
    async fn wrong_return_type_is_a_protocol_error() {
        let response = dispatcher().dispatch(request(3, vec![])).await;
        assert!(matches!(
            response.outcome,
            Outcome::ProtocolError(ProtocolFault::TypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn resolution_failures_are_protocol_errors() {
        let dispatcher = dispatcher();

        let unknown_method = dispatcher.dispatch(request(5, vec![])).await;
        assert_eq!(
            unknown_method.outcome,
            Outcome::ProtocolError(ProtocolFault::UnknownMethod {
                service: calculator_id(),
                index: 5
            })
        );

        let bad_args = dispatcher
            .dispatch(request(0, vec![Value::Int(2), Value::from("3")]))
            .await;
        assert!(matches!(
            bad_args.outcome,
            Outcome::ProtocolError(ProtocolFault::TypeMismatch(_))
        ));

        let unknown_service = dispatcher
            .dispatch(CallRequest::new(2, ServiceId::new("Nope", 1), 0, vec![]))
            .await;
        assert_eq!(
            unknown_service.outcome,
            Outcome::ProtocolError(ProtocolFault::UnknownService(ServiceId::new("Nope", 1)))
        );
    }

    #[tokio::test]
    async fn unbound_service_is_reported() {
        let dispatcher = dispatcher();
        dispatcher.implementations().unbind(&calculator_id()).unwrap();

        let response = dispatcher
            .dispatch(request(0, vec![Value::Int(1), Value::Int(1)]))
            .await;
        assert_eq!(
            response.outcome,
            Outcome::ProtocolError(ProtocolFault::NoImplementationBound(calculator_id()))
        );
    }

    #[tokio::test]
    async fn undecodable_request_still_gets_a_response() {
        let mut frame = codec::encode_request(&request(0, vec![Value::Int(1), Value::Int(2)])).unwrap();
        frame.call_id = 77;
        frame.payload.truncate(4);

        let response = codec::decode_response(&dispatcher().dispatch_frame(&frame).await).unwrap();
        assert_eq!(response.call_id, 77);
        assert!(matches!(
            response.outcome,
            Outcome::ProtocolError(ProtocolFault::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let pong = dispatcher().dispatch_frame(&Frame::ping(3)).await;
        assert_eq!(pong.kind(), Ok(FrameKind::Pong));
        assert_eq!(pong.call_id, 3);
    }

    #[test]
    fn bind_rules() {
        let registry = ImplementationRegistry::new();
        registry.bind(calculator_id(), Arc::new(Calculator)).unwrap();
        assert_eq!(
            registry.bind(calculator_id(), Arc::new(Calculator)).err(),
            Some(RegistryError::AlreadyBound(calculator_id()))
        );

        registry.unbind(&calculator_id()).unwrap();
        assert!(matches!(
            registry.lookup(&calculator_id()),
            Err(RegistryError::NoImplementationBound(_))
        ));
        registry.bind(calculator_id(), Arc::new(Calculator)).unwrap();
        assert_eq!(registry.bound(), vec![calculator_id()]);
    }

    #[test]
    fn binding_requires_a_registered_contract() {
        let dispatcher = Dispatcher::new(Arc::new(ContractRegistry::new()));
        assert_eq!(
            dispatcher.bind(calculator_id(), Calculator),
            Err(RegistryError::UnknownService(calculator_id()))
        );
    }

    #[test]
    fn arguments_decode_in_order() {
        let mut args = Arguments::new(vec![Value::Int(1), Value::from("two")]);
        assert_eq!(args.next::<i64>(), Ok(1));
        assert_eq!(args.remaining(), 1);
        assert!(args.next::<i64>().is_err());
        assert!(matches!(
            args.next::<String>(),
            Err(TypeMismatch::Arity { .. })
        ));
    }
}
