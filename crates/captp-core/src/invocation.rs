use crate::value::Value;

/// One operation on a capability.
///
/// On the wire the descriptor is the marshalled list `[prop]` for a property
/// read, `[null, args]` for a function application and `[prop, args]` for a
/// method call.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Get { prop: String },
    ApplyFunction { args: Vec<Value> },
    ApplyMethod { method: String, args: Vec<Value> },
}

impl Invocation {
    pub fn get(prop: impl Into<String>) -> Self {
        Invocation::Get { prop: prop.into() }
    }

    pub fn apply_function(args: impl IntoIterator<Item = Value>) -> Self {
        Invocation::ApplyFunction {
            args: args.into_iter().collect(),
        }
    }

    pub fn apply_method(method: impl Into<String>, args: impl IntoIterator<Item = Value>) -> Self {
        Invocation::ApplyMethod {
            method: method.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Name used in logs and trap requests.
    pub fn op_name(&self) -> &'static str {
        match self {
            Invocation::Get { .. } => "get",
            Invocation::ApplyFunction { .. } => "applyFunction",
            Invocation::ApplyMethod { .. } => "applyMethod",
        }
    }

    /// The method name for calls, the property for reads.
    pub fn name(&self) -> Option<&str> {
        match self {
            Invocation::Get { prop } => Some(prop),
            Invocation::ApplyFunction { .. } => None,
            Invocation::ApplyMethod { method, .. } => Some(method),
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            Invocation::Get { .. } => &[],
            Invocation::ApplyFunction { args } | Invocation::ApplyMethod { args, .. } => args,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Invocation::Get { prop } => Value::list([Value::from(prop.as_str())]),
            Invocation::ApplyFunction { args } => {
                Value::list([Value::Null, Value::List(args.clone())])
            }
            Invocation::ApplyMethod { method, args } => {
                Value::list([Value::from(method.as_str()), Value::List(args.clone())])
            }
        }
    }

    /// Decode a method descriptor. The error is a rejection reason.
    pub fn from_value(value: Value) -> Result<Self, Value> {
        let mut items = match value {
            Value::List(items) => items,
            other => {
                return Err(Value::type_error(format!(
                    "method descriptor must be a list, got {other:?}"
                )));
            }
        };
        match items.len() {
            1 => match items.pop() {
                Some(Value::String(prop)) => Ok(Invocation::Get { prop }),
                other => Err(Value::type_error(format!(
                    "property name must be a string, got {other:?}"
                ))),
            },
            2 => {
                let args = match items.pop() {
                    Some(Value::List(args)) => args,
                    other => {
                        return Err(Value::type_error(format!(
                            "arguments must be a list, got {other:?}"
                        )));
                    }
                };
                match items.pop() {
                    Some(Value::Null) | Some(Value::Undefined) => {
                        Ok(Invocation::ApplyFunction { args })
                    }
                    Some(Value::String(method)) => Ok(Invocation::ApplyMethod { method, args }),
                    other => Err(Value::type_error(format!(
                        "method name must be a string or null, got {other:?}"
                    ))),
                }
            }
            n => Err(Value::type_error(format!(
                "method descriptor must have 1 or 2 elements, got {n}"
            ))),
        }
    }
}
