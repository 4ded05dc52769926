//! # Remote-Control Registry
//!
//! Every core component exports a flat namespace of string parameters
//! with string values. The registry maps `(component, parameter)` to the
//! component's getter/setter so that a control surface (telnet, ZMQ, a
//! config reload) can reach into a running pipeline without knowing the
//! concrete stage types.
//!
//! Components hand the registry a shared handle ([`RemoteControllable`])
//! rather than deriving from a base class; the handle owns whatever
//! interior mutability the component needs. Unknown component or
//! parameter names and writes to read-only parameters are typed errors
//! reported synchronously to the caller, with component state unchanged.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub type RcResult<T> = Result<T, RcError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RcError {
    #[error("no such component: {0}")]
    UnknownComponent(String),

    #[error("parameter '{parameter}' is not exported by component '{component}'")]
    UnknownParameter { component: String, parameter: String },

    #[error("parameter '{0}' is read-only")]
    ReadOnly(String),

    #[error("invalid value for parameter '{parameter}': {message}")]
    InvalidValue { parameter: String, message: String },
}

/// A component that exports remote-controllable parameters.
///
/// Setters must validate fully before applying; a failed set leaves the
/// component unchanged. Getters always return the current value as a
/// string.
pub trait RemoteControllable: Send + Sync {
    /// Component name in the flat control namespace.
    fn rc_name(&self) -> &str;

    /// `(name, description)` pairs of the exported parameters.
    fn parameters(&self) -> Vec<(&'static str, &'static str)>;

    fn set_parameter(&self, parameter: &str, value: &str) -> RcResult<()>;

    fn get_parameter(&self, parameter: &str) -> RcResult<String>;
}

/// Name-keyed registry of remote-controllable components.
#[derive(Default)]
pub struct RcRegistry {
    components: Mutex<BTreeMap<String, Arc<dyn RemoteControllable>>>,
}

impl RcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its own `rc_name`. A later
    /// registration with the same name replaces the earlier one.
    pub fn register(&self, component: Arc<dyn RemoteControllable>) {
        let name = component.rc_name().to_string();
        self.components.lock().unwrap().insert(name, component);
    }

    pub fn set(&self, component: &str, parameter: &str, value: &str) -> RcResult<()> {
        self.lookup(component)?.set_parameter(parameter, value)
    }

    pub fn get(&self, component: &str, parameter: &str) -> RcResult<String> {
        self.lookup(component)?.get_parameter(parameter)
    }

    /// Names of all registered components.
    pub fn component_names(&self) -> Vec<String> {
        self.components.lock().unwrap().keys().cloned().collect()
    }

    /// The exported parameters of one component.
    pub fn parameters_of(&self, component: &str) -> RcResult<Vec<(&'static str, &'static str)>> {
        Ok(self.lookup(component)?.parameters())
    }

    fn lookup(&self, component: &str) -> RcResult<Arc<dyn RemoteControllable>> {
        self.components
            .lock()
            .unwrap()
            .get(component)
            .cloned()
            .ok_or_else(|| RcError::UnknownComponent(component.to_string()))
    }
}

/// Parse a parameter value, mapping the failure to [`RcError::InvalidValue`].
pub fn parse_value<T: FromStr>(parameter: &str, value: &str) -> RcResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| RcError::InvalidValue {
        parameter: parameter.to_string(),
        message: e.to_string(),
    })
}
