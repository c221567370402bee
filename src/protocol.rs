//! Per-instance step dispatcher for card authentication protocols.
//!
//! A [`SalProtocol`] instance sequences the steps of one running protocol:
//! ordered steps are consumed at most once, in order; stateless steps answer
//! their operation type at any time without moving the cursor. Step failures
//! are translated into non-ok responses, never unwound past the dispatcher.

use crate::definitions::{FunctionType, ResultType, SalRequest, SalResponse};
use std::collections::BTreeMap;
use tracing::debug;

/// Mutable scratch space shared by the steps of one protocol instance.
pub type InternalData = BTreeMap<String, serde_json::Value>;

/// One step of a card authentication protocol.
///
/// A step is a function from request and scratch space to response; it may
/// stash material in the scratch space for later steps of the same instance.
pub trait ProtocolStep: Send {
    fn function_type(&self) -> FunctionType;
    fn perform(
        &self,
        request: &SalRequest,
        internal_data: &mut InternalData,
    ) -> Result<SalResponse, StepFailure>;
}

/// A step-local failure, converted by the dispatcher into the mirror response
/// carrying this error result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("protocol step failed: {message}")]
pub struct StepFailure {
    pub minor: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(minor: &str, message: impl Into<String>) -> Self {
        StepFailure {
            minor: minor.to_string(),
            message: message.into(),
        }
    }
}

/// How a step participates in the flow.
pub enum StepRegistration {
    /// Consumed exactly once, in list order.
    Ordered(Box<dyn ProtocolStep>),
    /// Answers its operation type at any time, repeatably.
    Stateless(Box<dyn ProtocolStep>),
}

/// Wraps and unwraps command/response byte streams once a protocol has
/// established a secure channel to the card.
pub trait SecureMessaging: Send {
    fn apply(&self, command_apdu: &[u8]) -> Vec<u8>;
    fn remove(&self, response_apdu: &[u8]) -> Vec<u8>;
}

/// One running instance of a card authentication protocol.
pub struct SalProtocol {
    steps: Vec<Box<dyn ProtocolStep>>,
    stateless_steps: BTreeMap<FunctionType, Box<dyn ProtocolStep>>,
    cur_step: usize,
    internal_data: InternalData,
    sm: Option<Box<dyn SecureMessaging>>,
}

impl SalProtocol {
    pub fn new(registrations: impl IntoIterator<Item = StepRegistration>) -> Self {
        let mut steps = Vec::new();
        let mut stateless_steps = BTreeMap::new();
        for registration in registrations {
            match registration {
                StepRegistration::Ordered(step) => steps.push(step),
                StepRegistration::Stateless(step) => {
                    stateless_steps.insert(step.function_type(), step);
                }
            }
        }
        SalProtocol {
            steps,
            stateless_steps,
            cur_step: 0,
            internal_data: InternalData::new(),
            sm: None,
        }
    }

    /// True if a stateless step answers `function`, or the ordered step at
    /// the cursor has that type.
    pub fn has_next_step(&self, function: FunctionType) -> bool {
        self.stateless_steps.contains_key(&function) || self.has_next_ordered_step(function)
    }

    /// True once every ordered step is consumed. Remaining stateless steps do
    /// not count.
    pub fn is_finished(&self) -> bool {
        self.cur_step >= self.steps.len()
    }

    pub fn internal_data(&self) -> &InternalData {
        &self.internal_data
    }

    /// Executes the applicable step for the request's operation type.
    ///
    /// The ordered step at the cursor takes precedence and is consumed;
    /// otherwise a stateless step runs without moving the cursor; otherwise
    /// the mirror response with the inappropriate-protocol-step result is
    /// returned and the cursor stays untouched.
    pub fn dispatch(&mut self, request: &SalRequest) -> SalResponse {
        let function = request.function_type();
        let step = if self.has_next_ordered_step(function) {
            let step = &self.steps[self.cur_step];
            self.cur_step += 1;
            step
        } else if let Some(step) = self.stateless_steps.get(&function) {
            step
        } else {
            debug!(%function, cursor = self.cur_step, "no applicable protocol step");
            return request.inappropriate_step_response();
        };

        match step.perform(request, &mut self.internal_data) {
            Ok(response) => response,
            Err(failure) => {
                debug!(%function, error = %failure, "protocol step reported an error");
                request.error_response(ResultType::error(&failure.minor, failure.message))
            }
        }
    }

    /// Installs a secure-messaging wrapper. Until one is installed the hooks
    /// below are identity functions.
    pub fn set_secure_messaging(&mut self, sm: Box<dyn SecureMessaging>) {
        self.sm = Some(sm);
    }

    pub fn needs_sm(&self) -> bool {
        self.sm.is_some()
    }

    pub fn apply_sm(&self, command_apdu: &[u8]) -> Vec<u8> {
        match &self.sm {
            Some(sm) => sm.apply(command_apdu),
            None => command_apdu.to_vec(),
        }
    }

    pub fn remove_sm(&self, response_apdu: &[u8]) -> Vec<u8> {
        match &self.sm {
            Some(sm) => sm.remove(response_apdu),
            None => response_apdu.to_vec(),
        }
    }

    fn has_next_ordered_step(&self, function: FunctionType) -> bool {
        self.steps
            .get(self.cur_step)
            .map(|s| s.function_type() == function)
            .unwrap_or(false)
    }
}

/// Creates protocol instances for one protocol URI.
///
/// Factories are registered statically at startup; there is no runtime
/// discovery of protocol implementations.
pub trait ProtocolFactory: Send + Sync {
    fn protocol_uri(&self) -> &str;
    fn create(&self) -> SalProtocol;
}

/// Static map from protocol URI to factory.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: BTreeMap<String, Box<dyn ProtocolFactory>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn ProtocolFactory>) {
        self.factories
            .insert(factory.protocol_uri().to_string(), factory);
    }

    pub fn contains(&self, protocol_uri: &str) -> bool {
        self.factories.contains_key(protocol_uri)
    }

    pub fn create(&self, protocol_uri: &str) -> Option<SalProtocol> {
        self.factories.get(protocol_uri).map(|f| f.create())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::{result::minor, Sign, SignResponse};

    struct EchoStep {
        function: FunctionType,
        key: &'static str,
    }

    impl ProtocolStep for EchoStep {
        fn function_type(&self) -> FunctionType {
            self.function
        }

        fn perform(
            &self,
            request: &SalRequest,
            internal_data: &mut InternalData,
        ) -> Result<SalResponse, StepFailure> {
            internal_data.insert(self.key.to_string(), serde_json::json!(true));
            Ok(request.error_response(ResultType::ok()))
        }
    }

    struct FailingStep;

    impl ProtocolStep for FailingStep {
        fn function_type(&self) -> FunctionType {
            FunctionType::Sign
        }

        fn perform(
            &self,
            _request: &SalRequest,
            _internal_data: &mut InternalData,
        ) -> Result<SalResponse, StepFailure> {
            Err(StepFailure::new(minor::INTERNAL_ERROR, "no key material"))
        }
    }

    fn sign_request() -> SalRequest {
        SalRequest::Sign(Sign::default())
    }

    fn hash_request() -> SalRequest {
        SalRequest::Hash(crate::definitions::Hash::default())
    }

    #[test]
    fn ordered_steps_are_consumed_in_order() {
        let mut instance = SalProtocol::new([
            StepRegistration::Ordered(Box::new(EchoStep {
                function: FunctionType::Sign,
                key: "a",
            })),
            StepRegistration::Ordered(Box::new(EchoStep {
                function: FunctionType::Hash,
                key: "b",
            })),
        ]);

        assert!(instance.has_next_step(FunctionType::Sign));
        assert!(!instance.is_finished());

        assert!(instance.dispatch(&sign_request()).result().is_ok());
        // Sign is consumed; a second Sign has no applicable step
        let second = instance.dispatch(&sign_request());
        assert_eq!(
            second.result().result_minor.as_deref(),
            Some(minor::INAPPROPRIATE_PROTOCOL_FOR_ACTION)
        );
        assert!(!instance.is_finished());

        assert!(instance.dispatch(&hash_request()).result().is_ok());
        assert!(instance.is_finished());
        assert!(instance.internal_data().contains_key("a"));
        assert!(instance.internal_data().contains_key("b"));
    }

    #[test]
    fn stateless_steps_repeat_without_moving_the_cursor() {
        let mut instance = SalProtocol::new([
            StepRegistration::Ordered(Box::new(EchoStep {
                function: FunctionType::Hash,
                key: "ordered",
            })),
            StepRegistration::Stateless(Box::new(EchoStep {
                function: FunctionType::Sign,
                key: "stateless",
            })),
        ]);

        assert!(instance.dispatch(&sign_request()).result().is_ok());
        assert!(instance.dispatch(&sign_request()).result().is_ok());
        assert!(!instance.is_finished());
        // the ordered step is still pending
        assert!(instance.dispatch(&hash_request()).result().is_ok());
        // stateless steps left over do not keep the instance unfinished
        assert!(instance.is_finished());
    }

    #[test]
    fn ordered_step_takes_precedence_over_stateless() {
        let mut instance = SalProtocol::new([
            StepRegistration::Ordered(Box::new(EchoStep {
                function: FunctionType::Sign,
                key: "ordered",
            })),
            StepRegistration::Stateless(Box::new(EchoStep {
                function: FunctionType::Sign,
                key: "stateless",
            })),
        ]);

        instance.dispatch(&sign_request());
        assert!(instance.internal_data().contains_key("ordered"));
        assert!(!instance.internal_data().contains_key("stateless"));
        // consumed ordered step falls back to the stateless registration
        instance.dispatch(&sign_request());
        assert!(instance.internal_data().contains_key("stateless"));
    }

    #[test]
    fn step_failure_becomes_error_response() {
        let mut instance =
            SalProtocol::new([StepRegistration::Ordered(Box::new(FailingStep))]);
        let response = instance.dispatch(&sign_request());
        match response {
            SalResponse::Sign(SignResponse { result, signature }) => {
                assert!(!result.is_ok());
                assert_eq!(result.result_minor.as_deref(), Some(minor::INTERNAL_ERROR));
                assert!(signature.is_none());
            }
            other => panic!("unexpected response type: {:?}", other),
        }
    }

    #[test]
    fn sm_hooks_default_to_identity() {
        let instance = SalProtocol::new([]);
        assert!(!instance.needs_sm());
        assert_eq!(instance.apply_sm(&[1, 2, 3]), vec![1, 2, 3]);
        assert_eq!(instance.remove_sm(&[4, 5]), vec![4, 5]);
    }
}
