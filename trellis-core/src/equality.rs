//! Structural equality.
//!
//! Used to decide whether a recomputed derived value, or a value written
//! through an object wrapper, actually changed. Comparison is purely
//! structural and bounded in depth; there is no cycle detection.

use indexmap::IndexMap;

use crate::config::DEFAULT_COMPARE_DEPTH;
use crate::value::Value;

/// Depth-bounded structural comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparator {
    max_depth: usize,
}

impl Comparator {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Compare two values structurally.
    ///
    /// Values nested deeper than `max_depth` compare unequal, so an
    /// over-deep value is always treated as changed.
    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        self.equals_at(a, b, 0)
    }

    fn equals_at(&self, a: &Value, b: &Value, depth: usize) -> bool {
        if depth > self.max_depth {
            return false;
        }

        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                int_equals_float(*i, *f)
            }
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Seq(xs), Value::Seq(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| self.equals_at(x, y, depth + 1))
            }
            (Value::Map(xs), Value::Map(ys)) => self.fields_equal(xs, ys, depth),
            (
                Value::Record { name: xn, fields: xs },
                Value::Record { name: yn, fields: ys },
            ) => xn == yn && self.fields_equal(xs, ys, depth),
            _ => false,
        }
    }

    // Key order is irrelevant.
    fn fields_equal(
        &self,
        xs: &IndexMap<String, Value>,
        ys: &IndexMap<String, Value>,
        depth: usize,
    ) -> bool {
        xs.len() == ys.len()
            && xs.iter().all(|(key, x)| {
                ys.get(key)
                    .is_some_and(|y| self.equals_at(x, y, depth + 1))
            })
    }
}

/// Exact comparison: the float must be integral and inside the `i64`
/// range, so large ints never match a neighbouring rounded float.
fn int_equals_float(i: i64, f: f64) -> bool {
    // -2^63 and 2^63 are exactly representable.
    const LOWER: f64 = -9_223_372_036_854_775_808.0;
    const UPPER: f64 = 9_223_372_036_854_775_808.0;
    f.fract() == 0.0 && (LOWER..UPPER).contains(&f) && f as i64 == i
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new(DEFAULT_COMPARE_DEPTH)
    }
}
