//! The dynamic value model.
//!
//! `Value` is a tagged union with five variants (§3 of the design spec):
//! `Undefined`, `Int`, `Double`, `String`, `Array`. Every operator on it is a
//! total function over the tag pair that returns `Result<Value, VmError>` —
//! nothing in this module panics or throws across the dispatch loop; a
//! mismatched tag pair is encoded as a `VmError::Type` value instead.

use core::cell::RefCell;
use core::fmt;

use alloc::rc::Rc;

use ecow::EcoString;

use crate::error::VmError;
use crate::{vec, Vec};

/// A shared, mutable handle to an array's backing storage.
///
/// Arrays are reference types on the operand stack: pushing a `Value::Array`
/// copies the handle, not the elements, so `SetArrayIndex` mutation is
/// visible through every outstanding alias (§9). This is a single-threaded
/// VM, so `Rc<RefCell<_>>` is the natural idiomatic handle — no atomics, no
/// arena lifetime threaded through every API that touches a `Value`.
pub type ArrayHandle = Rc<RefCell<Vec<Value>>>;

/// A dynamically tagged VM value.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Undefined,
    Int(i32),
    Double(f64),
    String(EcoString),
    Array(ArrayHandle),
}

impl Value {
    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn string(s: impl Into<EcoString>) -> Value {
        Value::String(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
        }
    }

    /// Truthiness per §3: numerics are truthy iff `> 0`; strings/arrays are
    /// truthy iff non-empty; `Undefined` is always falsey.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Int(i) => *i > 0,
            Value::Double(d) => *d > 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    fn numeric_pair(a: &Value, b: &Value) -> Option<(Option<f64>, Option<f64>)> {
        match (a, b) {
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                Some((a.as_double(), b.as_double()))
            }
            _ => None,
        }
    }

    /// Numeric binary op promotion: `Double` if either operand is `Double`,
    /// else `Int`.
    fn arith(a: &Value, b: &Value, op: &'static str, f: impl Fn(f64, f64) -> f64) -> Result<Value, VmError> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                let result = f(*x as f64, *y as f64);
                Ok(Value::Int(result as i32))
            }
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                let x = a.as_double().unwrap();
                let y = b.as_double().unwrap();
                Ok(Value::Double(f(x, y)))
            }
            _ => Err(VmError::type_mismatch(op, a.type_name(), b.type_name())),
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value, VmError> {
        match (self, rhs) {
            (Value::String(a), Value::String(b)) => {
                let mut s = a.clone();
                s.push_str(b);
                Ok(Value::String(s))
            }
            _ => Self::arith(self, rhs, "+", |a, b| a + b),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, VmError> {
        Self::arith(self, rhs, "-", |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value, VmError> {
        Self::arith(self, rhs, "*", |a, b| a * b)
    }

    /// Division: integer division by zero raises `VmError::DivideByZero`
    /// rather than trapping the process; double division follows IEEE-754
    /// (±∞/NaN), since `f64`'s own `/` already implements that.
    pub fn div(&self, rhs: &Value) -> Result<Value, VmError> {
        match (self, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivideByZero),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x / y)),
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                Ok(Value::Double(self.as_double().unwrap() / rhs.as_double().unwrap()))
            }
            _ => Err(VmError::type_mismatch("/", self.type_name(), rhs.type_name())),
        }
    }

    pub fn rem(&self, rhs: &Value) -> Result<Value, VmError> {
        match (self, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivideByZero),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x % y)),
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                Ok(Value::Double(self.as_double().unwrap() % rhs.as_double().unwrap()))
            }
            _ => Err(VmError::type_mismatch("%", self.type_name(), rhs.type_name())),
        }
    }

    pub fn neg(&self) -> Result<Value, VmError> {
        match self {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Double(d) => Ok(Value::Double(-d)),
            _ => Err(VmError::type_mismatch("unary-", self.type_name(), self.type_name())),
        }
    }

    /// `!`: on numerics, logical negation of truthiness; on string/array,
    /// emptiness-based (per §4.2); on `Undefined`, a type error.
    pub fn invert(&self) -> Result<Value, VmError> {
        match self {
            Value::Undefined => Err(VmError::type_mismatch("!", "undefined", "undefined")),
            other => Ok(Value::Int(if other.truthy() { 0 } else { 1 })),
        }
    }

    pub fn pow(&self, rhs: &Value) -> Result<Value, VmError> {
        match Self::numeric_pair(self, rhs) {
            Some((Some(a), Some(b))) => Ok(Value::Double(libm_powf(a, b))),
            _ => Err(VmError::type_mismatch("**", self.type_name(), rhs.type_name())),
        }
    }

    fn as_int(&self) -> Result<i32, VmError> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(VmError::type_mismatch("bitwise", self.type_name(), "int")),
        }
    }

    pub fn bit_and(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int(self.as_int()? & rhs.as_int()?))
    }

    pub fn bit_or(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int(self.as_int()? | rhs.as_int()?))
    }

    pub fn bit_xor(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int(self.as_int()? ^ rhs.as_int()?))
    }

    pub fn bit_not(&self) -> Result<Value, VmError> {
        Ok(Value::Int(!self.as_int()?))
    }

    pub fn shl(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int(self.as_int()?.wrapping_shl(rhs.as_int()? as u32)))
    }

    pub fn shr(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int(self.as_int()?.wrapping_shr(rhs.as_int()? as u32)))
    }

    /// `==`: across differing tags always yields `Int(0)` (§3).
    pub fn eq_op(&self, rhs: &Value) -> Value {
        let result = match (self, rhs) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        Value::Int(result as i32)
    }

    pub fn ne_op(&self, rhs: &Value) -> Value {
        match self.eq_op(rhs) {
            Value::Int(0) => Value::Int(1),
            _ => Value::Int(0),
        }
    }

    /// Ordering requires both sides numeric (§4.2).
    fn order(&self, rhs: &Value) -> Result<core::cmp::Ordering, VmError> {
        match Self::numeric_pair(self, rhs) {
            Some((Some(a), Some(b))) => a.partial_cmp(&b).ok_or(VmError::DivideByZero),
            _ => Err(VmError::type_mismatch("compare", self.type_name(), rhs.type_name())),
        }
    }

    pub fn gt(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int((self.order(rhs)? == core::cmp::Ordering::Greater) as i32))
    }

    pub fn lt(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int((self.order(rhs)? == core::cmp::Ordering::Less) as i32))
    }

    pub fn ge(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int((self.order(rhs)? != core::cmp::Ordering::Less) as i32))
    }

    pub fn le(&self, rhs: &Value) -> Result<Value, VmError> {
        Ok(Value::Int((self.order(rhs)? != core::cmp::Ordering::Greater) as i32))
    }
}

/// `x ** y` always promotes to `Double` (§4.2); `libm` is overkill for a
/// single `pow`, so this uses the standard exponentiation-by-squaring plus
/// `f64::powf` from core — available without `std` since Rust 1.0 provides
/// `f64::powf` only via `std`. We implement a small no_std-safe fallback.
fn libm_powf(base: f64, exp: f64) -> f64 {
    #[cfg(feature = "std")]
    {
        base.powf(exp)
    }
    #[cfg(not(feature = "std"))]
    {
        // Integer fast path covers every exponent dialogue scripts realistically
        // emit (`**` on small integer powers); fall back to repeated squaring.
        if exp.fract() == 0.0 && exp.abs() < 64.0 {
            let mut result = 1.0;
            let mut e = exp.abs() as u32;
            let mut b = base;
            while e > 0 {
                if e & 1 == 1 {
                    result *= b;
                }
                b *= b;
                e >>= 1;
            }
            if exp < 0.0 {
                1.0 / result
            } else {
                result
            }
        } else {
            f64::NAN
        }
    }
}

impl fmt::Display for Value {
    /// Renders a value for string interpolation (§4.6): numerics as decimal,
    /// `Undefined` as an empty string, strings inline, arrays as a bracketed
    /// sequence with each element rendered the same way (recursively).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, elem) in a.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_int_plus_int_is_int() {
        assert!(matches!(Value::Int(3).add(&Value::Int(4)), Ok(Value::Int(7))));
    }

    #[test]
    fn promotion_int_plus_double_is_double() {
        let v = Value::Int(3).add(&Value::Double(0.5)).unwrap();
        match v {
            Value::Double(d) => assert_eq!(d, 3.5),
            _ => panic!("expected double"),
        }
    }

    #[test]
    fn equality_across_tags_is_zero() {
        assert!(matches!(Value::Int(1).eq_op(&Value::string("1")), Value::Int(0)));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(1).truthy());
        assert!(!Value::string("").truthy());
        assert!(Value::string("x").truthy());
        assert!(!Value::array(Vec::new()).truthy());
    }

    #[test]
    fn array_mutation_is_shared_through_clone() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let alias = arr.clone();
        if let Value::Array(handle) = &arr {
            handle.borrow_mut()[0] = Value::Int(99);
        }
        if let Value::Array(handle) = &alias {
            assert!(matches!(handle.borrow()[0], Value::Int(99)));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn interpolation_render_matches_spec_conventions() {
        assert_eq!(Value::Undefined.to_string(), "");
        assert_eq!(Value::Int(7).to_string(), "7");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::string("a")]).to_string(),
            "[1, a]"
        );
    }

    #[test]
    fn division_by_zero_errors_for_int() {
        assert!(Value::Int(1).div(&Value::Int(0)).is_err());
    }

    #[test]
    fn division_by_zero_is_inf_for_double() {
        let v = Value::Double(1.0).div(&Value::Double(0.0)).unwrap();
        assert!(matches!(v, Value::Double(d) if d.is_infinite()));
    }
}
