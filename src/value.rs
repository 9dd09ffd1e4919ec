use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("Unsupported operands for {op}: {lhs} and {rhs}")]
    UnsupportedOperands {
        op: ArithmeticOp,
        lhs: ValueKind,
        rhs: ValueKind,
    },
    #[error("Cannot broadcast shapes {0:?} and {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error("Tensor data of length {len} does not fit shape {shape:?}")]
    InvalidShape { len: usize, shape: Vec<usize> },
    #[error("Integer division by zero")]
    DivisionByZero,
    #[error("Integer overflow in {0}")]
    Overflow(ArithmeticOp),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Tensor,
    List,
    #[default]
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    fn apply_f64(&self, a: f64, b: f64) -> f64 {
        match self {
            ArithmeticOp::Add => a + b,
            ArithmeticOp::Sub => a - b,
            ArithmeticOp::Mul => a * b,
            ArithmeticOp::Div => a / b,
        }
    }

    fn apply_f32(&self, a: f32, b: f32) -> f32 {
        match self {
            ArithmeticOp::Add => a + b,
            ArithmeticOp::Sub => a - b,
            ArithmeticOp::Mul => a * b,
            ArithmeticOp::Div => a / b,
        }
    }

    fn apply_i64(&self, a: i64, b: i64) -> Result<Value, ValueError> {
        let out = match self {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            ArithmeticOp::Mul => a.checked_mul(b),
            ArithmeticOp::Div => {
                if b == 0 {
                    return Err(ValueError::DivisionByZero);
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
        };
        out.map(Value::Int).ok_or(ValueError::Overflow(*self))
    }
}

/// A concrete value flowing through an intervention graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(ArrayD<f32>),
    List(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Tensor(_) => ValueKind::Tensor,
            Value::List(_) => ValueKind::List,
        }
    }

    pub fn tensor_from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self, ValueError> {
        let len = data.len();
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::Tensor)
            .map_err(|_| ValueError::InvalidShape {
                len,
                shape: shape.to_vec(),
            })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(x) => Some(*x as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(x) => Some(x),
            _ => None,
        }
    }

    /// Elementwise arithmetic. Tensors broadcast against each other and against numeric scalars.
    pub fn apply(&self, op: ArithmeticOp, rhs: &Value) -> Result<Value, ValueError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => op.apply_i64(*a, *b),
            (Value::Tensor(a), Value::Tensor(b)) => {
                Ok(Value::Tensor(zip_broadcast(a, b, |x, y| op.apply_f32(x, y))?))
            }
            (Value::Tensor(a), scalar) if scalar.as_f64().is_some() => {
                let s = scalar.as_f64().unwrap_or_default() as f32;
                Ok(Value::Tensor(a.mapv(|x| op.apply_f32(x, s))))
            }
            (scalar, Value::Tensor(b)) if scalar.as_f64().is_some() => {
                let s = scalar.as_f64().unwrap_or_default() as f32;
                Ok(Value::Tensor(b.mapv(|x| op.apply_f32(s, x))))
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(op.apply_f64(a, b))),
                _ => Err(ValueError::UnsupportedOperands {
                    op,
                    lhs: a.kind(),
                    rhs: b.kind(),
                }),
            },
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value, ValueError> {
        self.apply(ArithmeticOp::Add, rhs)
    }
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim_at = |shape: &[usize], i: usize| {
        let offset = rank - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let (da, db) = (dim_at(a, i), dim_at(b, i));
        out.push(match (da, db) {
            _ if da == db => da,
            (1, _) => db,
            (_, 1) => da,
            _ => return None,
        });
    }
    Some(out)
}

fn zip_broadcast(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, ValueError> {
    let mismatch = || ValueError::ShapeMismatch(a.shape().to_vec(), b.shape().to_vec());
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(mismatch)?;
    let a_view = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let b_view = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(a_view).and(b_view).map_collect(|&x, &y| f(x, y)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(x) => write!(f, "{x}"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(x) => write!(f, "{x:?}"),
            Value::Tensor(x) => write!(f, "tensor{:?}", x.shape()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(value: ArrayD<f32>) -> Self {
        Value::Tensor(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

/// Expected kind and shape of a node's value, known before execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyValue {
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
}

impl ProxyValue {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_kind(kind: ValueKind) -> Self {
        Self { kind, shape: None }
    }

    pub fn tensor(shape: Vec<usize>) -> Self {
        Self {
            kind: ValueKind::Tensor,
            shape: Some(shape),
        }
    }

    pub fn of(value: &Value) -> Self {
        match value {
            Value::Tensor(x) => Self::tensor(x.shape().to_vec()),
            other => Self::of_kind(other.kind()),
        }
    }

    /// Best-effort proxy for the result of `op` applied to two proxies.
    pub fn combine(&self, rhs: &ProxyValue, op: ArithmeticOp) -> Self {
        match (self.kind, rhs.kind) {
            (ValueKind::Tensor, ValueKind::Tensor) => match (&self.shape, &rhs.shape) {
                (Some(a), Some(b)) => broadcast_shape(a, b)
                    .map(Self::tensor)
                    .unwrap_or_else(|| Self::of_kind(ValueKind::Tensor)),
                _ => Self::of_kind(ValueKind::Tensor),
            },
            (ValueKind::Tensor, ValueKind::Int | ValueKind::Float) => self.clone(),
            (ValueKind::Int | ValueKind::Float, ValueKind::Tensor) => rhs.clone(),
            (ValueKind::Int, ValueKind::Int) if op != ArithmeticOp::Div => {
                Self::of_kind(ValueKind::Int)
            }
            (ValueKind::Int | ValueKind::Float, ValueKind::Int | ValueKind::Float) => {
                Self::of_kind(ValueKind::Float)
            }
            _ => Self::any(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_stays_int() {
        let out = Value::Int(5).add(&Value::Int(3)).unwrap();
        assert_eq!(out, Value::Int(8));
        let out = Value::Int(5).apply(ArithmeticOp::Div, &Value::Int(2)).unwrap();
        assert_eq!(out, Value::Float(2.5));
    }

    #[test]
    fn test_int_division_by_zero() {
        let err = Value::Int(1).apply(ArithmeticOp::Div, &Value::Int(0)).unwrap_err();
        assert!(matches!(err, ValueError::DivisionByZero));
    }

    #[test]
    fn test_int_overflow_is_reported() {
        let err = Value::Int(i64::MAX).add(&Value::Int(1)).unwrap_err();
        assert!(matches!(err, ValueError::Overflow(ArithmeticOp::Add)));
    }

    #[test]
    fn test_tensor_broadcast_add() {
        let a = Value::tensor_from_vec(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).unwrap();
        let b = Value::tensor_from_vec(vec![10., 20., 30.], &[3]).unwrap();
        let out = a.add(&b).unwrap();
        let expected =
            Value::tensor_from_vec(vec![11., 22., 33., 14., 25., 36.], &[2, 3]).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_tensor_scalar_mul() {
        let a = Value::tensor_from_vec(vec![1., 2.], &[2]).unwrap();
        let out = Value::Int(3).apply(ArithmeticOp::Mul, &a).unwrap();
        assert_eq!(out, Value::tensor_from_vec(vec![3., 6.], &[2]).unwrap());
    }

    #[test]
    fn test_tensor_shape_mismatch() {
        let a = Value::tensor_from_vec(vec![1., 2.], &[2]).unwrap();
        let b = Value::tensor_from_vec(vec![1., 2., 3.], &[3]).unwrap();
        let err = a.add(&b).unwrap_err();
        assert!(matches!(err, ValueError::ShapeMismatch(_, _)));
    }

    #[test]
    fn test_unsupported_operands() {
        let err = Value::from("a").add(&Value::Int(1)).unwrap_err();
        assert!(matches!(
            err,
            ValueError::UnsupportedOperands {
                lhs: ValueKind::Str,
                rhs: ValueKind::Int,
                ..
            }
        ));
    }

    #[test]
    fn test_proxy_combine() {
        let a = ProxyValue::tensor(vec![4, 1]);
        let b = ProxyValue::tensor(vec![3]);
        assert_eq!(a.combine(&b, ArithmeticOp::Add), ProxyValue::tensor(vec![4, 3]));
        let i = ProxyValue::of_kind(ValueKind::Int);
        assert_eq!(i.combine(&i, ArithmeticOp::Div).kind, ValueKind::Float);
    }
}
