use serde::{de, Deserialize, Deserializer, Serialize};
use std::{cell::Cell, fmt};
use thiserror::Error;

/// Deepest nesting of lists, records and optionals accepted when decoding.
pub const MAX_NESTING: usize = 64;

thread_local! {
    static NESTING: Cell<usize> = Cell::new(0);
}

/// Decodes one level of nesting. Decoding recurses once per level, so input
/// nested deeper than [`MAX_NESTING`] is refused instead of exhausting the stack.
fn nested<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct Level;

    impl Drop for Level {
        fn drop(&mut self) {
            NESTING.with(|n| n.set(n.get() - 1));
        }
    }

    let depth = NESTING.with(|n| {
        n.set(n.get() + 1);
        n.get()
    });
    let _level = Level;
    if depth > MAX_NESTING {
        return Err(de::Error::custom(format_args!(
            "nesting exceeds {MAX_NESTING} levels"
        )));
    }
    T::deserialize(deserializer)
}

/// The shape of a [`Value`], as declared by a method's parameters and return type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Type {
    Nil,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List(#[serde(deserialize_with = "nested")] Box<Type>),
    /// `Nil` or a value of the inner type.
    Optional(#[serde(deserialize_with = "nested")] Box<Type>),
    /// Named fields, checked in declaration order.
    Record(#[serde(deserialize_with = "nested")] Vec<Field>),
    /// Accepts every value.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Type {
    pub fn list(item: Type) -> Self {
        Type::List(Box::new(item))
    }

    pub fn optional(inner: Type) -> Self {
        Type::Optional(Box::new(inner))
    }

    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, Type)>) -> Self {
        Type::Record(
            fields
                .into_iter()
                .map(|(name, ty)| Field {
                    name: name.into(),
                    ty,
                })
                .collect(),
        )
    }

    fn name(&self) -> &'static str {
        use Type::*;
        match self {
            Nil => "Nil",
            Bool => "Bool",
            Int => "Int",
            Float => "Float",
            String => "String",
            Bytes => "Bytes",
            List(_) => "List",
            Optional(_) => "Optional",
            Record(_) => "Record",
            Any => "Any",
        }
    }

    /// Checks `value` against this type without converting anything.
    pub fn check(&self, value: &Value) -> Result<(), TypeMismatch> {
        let matches = match (self, value) {
            (Type::Any, _) => true,
            (Type::Nil, Value::Nil)
            | (Type::Bool, Value::Bool(_))
            | (Type::Int, Value::Int(_))
            | (Type::Float, Value::Float(_))
            | (Type::String, Value::String(_))
            | (Type::Bytes, Value::Bytes(_)) => true,
            (Type::Optional(_), Value::Nil) => true,
            (Type::Optional(inner), value) => return inner.check(value),
            (Type::List(item), Value::List(values)) => {
                return values.iter().try_for_each(|v| item.check(v));
            }
            (Type::Record(fields), Value::Record(values)) => {
                if fields.len() != values.len()
                    || fields
                        .iter()
                        .zip(values)
                        .any(|(field, (name, _))| field.name != *name)
                {
                    false
                } else {
                    return fields
                        .iter()
                        .zip(values)
                        .try_for_each(|(field, (_, v))| field.ty.check(v));
                }
            }
            _ => false,
        };

        if matches {
            Ok(())
        } else {
            Err(TypeMismatch::new(value.clone(), self.clone()))
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Type::List(item) | Type::Optional(item) => write!(f, "<{item}>"),
            Type::Record(fields) => {
                f.write_str(" {")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {}: {}", field.name, field.ty)?;
                }
                f.write_str(" }")
            }
            _ => Ok(()),
        }
    }
}

/// A self-describing value that crosses the wire.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(#[serde(deserialize_with = "nested")] Vec<Value>),
    Record(#[serde(deserialize_with = "nested")] Vec<(String, Value)>),
}

impl Value {
    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, Value)>) -> Self {
        Value::Record(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }

    /// Looks up a field of a record by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Removes a field from a record, for decoding records into owned structs.
    pub fn take_field(&mut self, name: &str) -> Option<Value> {
        match self {
            Value::Record(fields) => {
                let index = fields.iter().position(|(n, _)| n == name)?;
                Some(fields.remove(index).1)
            }
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

pub trait Typed {
    fn rpc_type() -> Type;
}

pub trait Encode {
    fn encode(val: Self) -> Value;
}

pub trait Decode: Sized {
    fn decode(val: Value) -> Result<Self, TypeMismatch>;
}

macro_rules! impl_encode_decode {
    ($rust_type:ty, $rpc_type:expr, $encode_name:pat => $encode_expr:expr, $($from_rpc_arm:tt)*) => {
        impl Typed for $rust_type {
            fn rpc_type() -> Type {
                $rpc_type
            }
        }

        impl Encode for $rust_type {
            fn encode($encode_name: $rust_type) -> Value {
                $encode_expr
            }
        }

        impl Decode for $rust_type {
            fn decode(val: Value) -> Result<Self, TypeMismatch> {
                Ok(match val {
                    $($from_rpc_arm)*,
                    _ => return Err(TypeMismatch::new(val, <Self as Typed>::rpc_type()))
                })
            }
        }
    };
}

impl_encode_decode!((), Type::Nil, () => Value::Nil, Value::Nil => ());
impl_encode_decode!(bool, Type::Bool, b => Value::Bool(b), Value::Bool(b) => b);
impl_encode_decode!(i64, Type::Int, n => Value::Int(n), Value::Int(n) => n);
impl_encode_decode!(f64, Type::Float, x => Value::Float(x), Value::Float(x) => x);
impl_encode_decode!(String, Type::String, s => Value::String(s), Value::String(s) => s);

impl Typed for i32 {
    fn rpc_type() -> Type {
        Type::Int
    }
}

impl Encode for i32 {
    fn encode(n: i32) -> Value {
        Value::Int(n.into())
    }
}

impl Decode for i32 {
    // Out-of-range integers are a mismatch, not a truncation.
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::Int(n) => i32::try_from(n).map_err(|_| TypeMismatch::new(val, Type::Int)),
            _ => Err(TypeMismatch::new(val, Type::Int)),
        }
    }
}

impl Typed for Value {
    fn rpc_type() -> Type {
        Type::Any
    }
}

impl Encode for Value {
    fn encode(val: Value) -> Value {
        val
    }
}

impl Decode for Value {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        Ok(val)
    }
}

impl<T: Typed> Typed for Vec<T> {
    fn rpc_type() -> Type {
        Type::list(T::rpc_type())
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(val: Vec<T>) -> Value {
        Value::List(val.into_iter().map(T::encode).collect())
    }
}

impl<T: Decode + Typed> Decode for Vec<T> {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::List(values) => values.into_iter().map(T::decode).collect(),
            _ => Err(TypeMismatch::new(val, <Self as Typed>::rpc_type())),
        }
    }
}

impl<T: Typed> Typed for Option<T> {
    fn rpc_type() -> Type {
        Type::optional(T::rpc_type())
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(val: Option<T>) -> Value {
        val.map_or(Value::Nil, T::encode)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::Nil => Ok(None),
            val => T::decode(val).map(Some),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum TypeMismatch {
    #[error("type error: {value:?} is not a {expected}")]
    Value { value: Value, expected: Type },

    #[error("arity error: expected {expected} arguments, got {found}")]
    Arity { expected: usize, found: usize },

    #[error("record is missing field `{0}`")]
    MissingField(String),
}

impl TypeMismatch {
    pub fn new(value: Value, expected: Type) -> Self {
        TypeMismatch::Value { value, expected }
    }
}
